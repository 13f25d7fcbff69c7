//! Dataset admission: ticket validation at join time.
//!
//! The server checks the ticket carried by a `Join` before the
//! connection is allowed into a dataset session. Validation is a trait
//! so deployments can plug in whatever issues their tickets; the
//! implementations here cover open instances and fixed ticket sets.

use std::collections::HashMap;
use std::fmt;

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The ticket is not one this server knows about.
    InvalidTicket,
    /// The ticket is real but issued for a different dataset.
    WrongDataset,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidTicket => write!(f, "ticket not recognized"),
            AuthError::WrongDataset => {
                write!(f, "ticket does not grant access to this dataset")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Decides whether a ticket admits a connection to a dataset.
pub trait TicketValidator: Send + Sync {
    fn validate(&self, dataset: &str, ticket: &str) -> Result<(), AuthError>;
}

/// Admits every ticket. The default for local and test servers.
pub struct AllowAll;

impl TicketValidator for AllowAll {
    fn validate(&self, _dataset: &str, _ticket: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// A fixed ticket table, each ticket granting exactly one dataset.
pub struct StaticTickets {
    tickets: HashMap<String, String>,
}

impl StaticTickets {
    pub fn new() -> Self {
        Self {
            tickets: HashMap::new(),
        }
    }

    /// Add a ticket granting access to `dataset`.
    pub fn grant(mut self, ticket: impl Into<String>, dataset: impl Into<String>) -> Self {
        self.tickets.insert(ticket.into(), dataset.into());
        self
    }
}

impl Default for StaticTickets {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketValidator for StaticTickets {
    fn validate(&self, dataset: &str, ticket: &str) -> Result<(), AuthError> {
        match self.tickets.get(ticket) {
            None => Err(AuthError::InvalidTicket),
            Some(granted) if granted != dataset => Err(AuthError::WrongDataset),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_admits_anything() {
        let v = AllowAll;
        assert!(v.validate("ds1", "whatever").is_ok());
        assert!(v.validate("", "").is_ok());
    }

    #[test]
    fn test_static_tickets_admit_matching_dataset() {
        let v = StaticTickets::new()
            .grant("t-alpha", "ds1")
            .grant("t-beta", "ds2");
        assert!(v.validate("ds1", "t-alpha").is_ok());
        assert!(v.validate("ds2", "t-beta").is_ok());
    }

    #[test]
    fn test_unknown_ticket_rejected() {
        let v = StaticTickets::new().grant("t-alpha", "ds1");
        assert_eq!(v.validate("ds1", "t-zulu"), Err(AuthError::InvalidTicket));
    }

    #[test]
    fn test_wrong_dataset_rejected() {
        let v = StaticTickets::new().grant("t-alpha", "ds1");
        assert_eq!(v.validate("ds2", "t-alpha"), Err(AuthError::WrongDataset));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(AuthError::InvalidTicket.to_string(), "ticket not recognized");
        assert_eq!(
            AuthError::WrongDataset.to_string(),
            "ticket does not grant access to this dataset"
        );
    }
}
