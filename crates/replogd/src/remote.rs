//! The contract between replica workers and whatever actually talks to a
//! replica server.
//!
//! A [`DirectoryConnector`] opens sessions; a [`DirectorySession`] applies
//! single operations. Implementations report an unreachable or vanished
//! server as [`OpError::Retryable`] and every other failure as
//! [`OpError::Fatal`].

use crate::config::ReplicaConfig;
use crate::error::{ConnectError, OpError};
use crate::record::{AttributeValue, Change, ChangeRecord, Modification};

/// An open, bound session to one replica.
pub trait DirectorySession: Send {
    /// Add a new entry.
    fn add(&mut self, dn: &str, attributes: &[AttributeValue]) -> Result<(), OpError>;

    /// Apply modifications in order.
    fn modify(&mut self, dn: &str, modifications: &[Modification]) -> Result<(), OpError>;

    /// Delete an entry.
    fn delete(&mut self, dn: &str) -> Result<(), OpError>;

    /// Rename an entry, optionally moving it under `new_superior`.
    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<(), OpError>;

    /// Close the session. Errors are not reported.
    fn unbind(&mut self) {}
}

/// Opens sessions to replicas.
///
/// A connector negotiates protocol version 3, does not chase referrals,
/// applies the replica's TLS policy and binds with its configured method.
pub trait DirectoryConnector: Send + Sync {
    /// Establish a session to `replica`.
    fn connect(&self, replica: &ReplicaConfig) -> Result<Box<dyn DirectorySession>, ConnectError>;
}

/// Apply `record` through `session`, dispatching on the kind of change.
pub fn apply(session: &mut dyn DirectorySession, record: &ChangeRecord) -> Result<(), OpError> {
    match &record.change {
        Change::Add { attributes } => {
            if attributes.is_empty() {
                return Err(OpError::fatal("No modifications to do"));
            }
            session.add(&record.dn, attributes)
        }
        Change::Modify { modifications } => {
            if modifications.is_empty() {
                return Err(OpError::fatal("No arguments given"));
            }
            session.modify(&record.dn, modifications)
        }
        Change::Delete => session.delete(&record.dn),
        Change::Rename {
            new_rdn,
            delete_old_rdn,
            new_superior,
        } => session.rename(
            &record.dn,
            new_rdn,
            *delete_old_rdn,
            new_superior.as_deref(),
        ),
    }
}
