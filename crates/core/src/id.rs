//! Identifier newtypes shared across the platform.
//!
//! Two families live here. Entity identifiers ([`TenantId`], [`RunId`]) are
//! time-ordered UUIDv7, so index scans over freshly created rows stay close
//! to insertion order. Protocol tokens ([`LeaseToken`], [`FinalizeToken`])
//! are random UUIDv4: holding one proves the bearer acquired it through the
//! protocol, which only works if tokens cannot be derived from a timestamp.
//! All four parse from and print as plain UUID strings.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Billing principal an API caller acts as (multi-tenant boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

/// One asynchronous pack execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

/// Worker visibility-lease token.
///
/// Minted fresh on every lease acquisition; the worker's finalize claim is
/// conditioned on its token still being the one on the run row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

/// Finalize-claim ownership token, identifying the actor holding the claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalizeToken(Uuid);

/// Conversions and string round-tripping common to every id family.
macro_rules! uuid_string_impls {
    ($($t:ty => $label:literal),* $(,)?) => {$(
        impl $t {
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self)
                    .map_err(|e| DomainError::invalid_id(format!("{} '{s}': {e}", $label)))
            }
        }
    )*};
}

uuid_string_impls! {
    TenantId => "tenant id",
    RunId => "run id",
    LeaseToken => "lease token",
    FinalizeToken => "finalize token",
}

/// Entity ids: freely allocatable, convertible to/from raw UUIDs.
macro_rules! entity_id_impls {
    ($($t:ty),* $(,)?) => {$(
        impl $t {
            /// Allocate a fresh identifier (UUIDv7, time-ordered). Tests
            /// wanting determinism should build from a fixed [`Uuid`] via
            /// `from_uuid` instead of calling this.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    )*};
}

entity_id_impls!(TenantId, RunId);

/// Protocol tokens: minted, never derived.
macro_rules! token_impls {
    ($($t:ty),* $(,)?) => {$(
        impl $t {
            /// Mint a fresh random token (UUIDv4, unguessable).
            pub fn mint() -> Self {
                Self(Uuid::new_v4())
            }
        }
    )*};
}

token_impls!(LeaseToken, FinalizeToken);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_round_trips_through_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn token_round_trips_through_string() {
        let token = FinalizeToken::mint();
        let parsed: FinalizeToken = token.to_string().parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn invalid_id_string_is_rejected() {
        assert!("not-a-uuid".parse::<TenantId>().is_err());
        assert!("not-a-uuid".parse::<LeaseToken>().is_err());
    }

    #[test]
    fn minted_tokens_are_distinct() {
        assert_ne!(FinalizeToken::mint(), FinalizeToken::mint());
        assert_ne!(LeaseToken::mint(), LeaseToken::mint());
    }
}
