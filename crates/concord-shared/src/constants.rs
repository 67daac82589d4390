/// Separates the two participant ids inside a private chat's local id.
/// Only used when the id is written out; see [`crate::Entity::private_participants`].
pub const PRIVATE_CHAT_DELIMITER: char = ':';

/// Separates realm, account and local id in a serialized entity id.
pub const ENTITY_ID_SEPARATOR: char = '/';
