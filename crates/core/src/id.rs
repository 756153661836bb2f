//! Strongly-typed identifiers used across the domain.

/// Declare a UUID-backed identifier newtype.
///
/// The generated type is `Copy`, serialises transparently, parses from a string into
/// `DomainError::InvalidId`, and mints UUIDv7 (time-ordered) values via `new()`.
/// Callers need `serde` and `uuid` as direct dependencies.
#[macro_export]
macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(transparent)]
        pub struct $t(::uuid::Uuid);

        impl $t {
            /// Create a new identifier (UUIDv7). Prefer explicit ids in tests.
            pub fn new() -> Self {
                Self(::uuid::Uuid::now_v7())
            }

            pub fn from_uuid(uuid: ::uuid::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &::uuid::Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<::uuid::Uuid> for $t {
            fn from(value: ::uuid::Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for ::uuid::Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl core::str::FromStr for $t {
            type Err = $crate::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = ::uuid::Uuid::parse_str(s.trim())
                    .map_err(|e| $crate::DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a tenant (multi-tenant boundary).
    TenantId,
    "TenantId"
);

uuid_id!(
    /// Identifier of an aggregate root (one event stream per aggregate).
    AggregateId,
    "AggregateId"
);
