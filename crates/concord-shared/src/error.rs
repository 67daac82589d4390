use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("Malformed entity id: {0}")]
    Malformed(String),

    #[error("Identity conflict: both participants resolve to {local_id} in realm {realm_id}")]
    IdentityConflict { realm_id: String, local_id: String },
}
