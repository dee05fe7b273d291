use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::util::digest_parts;

const SIGNATURE_HEX_LEN: usize = 24;

/// Catchup position: the server timestamp of the last event a client has seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CatchupCursor {
    pub position: i64,
}

/// Mints and verifies opaque `<position>.<signature>` tokens bound to one actor.
#[derive(Clone)]
pub struct CursorCodec {
    secret: Arc<str>,
}

impl CursorCodec {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
        }
    }

    pub fn encode(&self, actor: &ActorIdentity, position: i64) -> String {
        format!("{position}.{}", self.signature(&actor.user_id, position))
    }

    pub fn decode(&self, actor: &ActorIdentity, token: &str) -> DomainResult<CatchupCursor> {
        let (position, signature) = token
            .trim()
            .split_once('.')
            .ok_or(DomainError::InvalidCursor)?;
        let position: i64 = position.parse().map_err(|_| DomainError::InvalidCursor)?;
        let expected = self.signature(&actor.user_id, position);
        let matches: bool = signature.as_bytes().ct_eq(expected.as_bytes()).into();
        if position < 0 || !matches {
            return Err(DomainError::InvalidCursor);
        }
        Ok(CatchupCursor { position })
    }

    fn signature(&self, actor_id: &str, position: i64) -> String {
        let position = position.to_string();
        let digest = digest_parts(&[self.secret.as_ref(), actor_id, position.as_str()]);
        digest[..SIGNATURE_HEX_LEN].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_bound_to_its_actor() {
        let codec = CursorCodec::new("secret");
        let alice = ActorIdentity::with_user_id("alice");
        let bob = ActorIdentity::with_user_id("bob");

        let token = codec.encode(&alice, 1_700_000_000_000);
        assert_eq!(
            codec.decode(&alice, &token).unwrap(),
            CatchupCursor {
                position: 1_700_000_000_000
            }
        );
        assert!(matches!(
            codec.decode(&bob, &token),
            Err(DomainError::InvalidCursor)
        ));
    }

    #[test]
    fn rejects_tampered_or_malformed_tokens() {
        let codec = CursorCodec::new("secret");
        let alice = ActorIdentity::with_user_id("alice");
        let token = codec.encode(&alice, 500);
        let tampered = token.replacen("500", "900", 1);

        for bad in [tampered.as_str(), "", "500", "abc.def", "-1.00"] {
            assert!(codec.decode(&alice, bad).is_err(), "{bad}");
        }
        assert!(
            CursorCodec::new("other")
                .decode(&alice, &token)
                .is_err()
        );
    }

    #[test]
    fn signature_must_match_in_full() {
        let codec = CursorCodec::new("secret");
        let alice = ActorIdentity::with_user_id("alice");
        let token = codec.encode(&alice, 500);

        let truncated = &token[..token.len() - 1];
        let extended = format!("{token}0");
        for bad in [truncated, extended.as_str(), "500."] {
            assert!(
                matches!(codec.decode(&alice, bad), Err(DomainError::InvalidCursor)),
                "{bad}"
            );
        }
    }
}
