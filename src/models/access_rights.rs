//! Effective access rights of a user over a project (and its files).

use serde::{Deserialize, Serialize};

/// Read/write/delete triple. Never persisted, always derived per request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessRights {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub delete: bool,
}

impl AccessRights {
    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            delete: false,
        }
    }

    /// Logical OR of two grants.
    pub fn merge(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            delete: self.delete || other.delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_a_logical_or() {
        let read_only = AccessRights {
            read: true,
            ..AccessRights::none()
        };
        let delete_only = AccessRights {
            delete: true,
            ..AccessRights::none()
        };
        let merged = read_only.merge(delete_only);
        assert!(merged.read && merged.delete && !merged.write);
        assert_eq!(AccessRights::none().merge(AccessRights::all()), AccessRights::all());
    }

    #[test]
    fn missing_fields_deserialize_as_denied() {
        let rights: AccessRights = serde_json::from_str(r#"{"read": true}"#).unwrap();
        assert_eq!(
            rights,
            AccessRights {
                read: true,
                write: false,
                delete: false
            }
        );
    }
}
