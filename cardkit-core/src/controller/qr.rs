//! Unsigned QR payloads.
//!
//! Format: `CARD:<cardId>:OWNER:<owner>:ROLE:<role>:TIMESTAMP:<ms>`, either
//! as raw text or as its URL-safe base64 encoding. The payload carries no
//! proof of freshness, so admissions based on it form a lower trust tier.

use std::fmt;

use crate::encoding::{decode_b64url, encode_b64url};
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::CardId;
use crate::role::Role;

const PREFIX: &str = "CARD:";
const OWNER_SEP: &str = ":OWNER:";
const ROLE_SEP: &str = ":ROLE:";
const TIMESTAMP_SEP: &str = ":TIMESTAMP:";

/// Parsed QR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    /// Card identifier.
    pub card_id: CardId,
    /// Holder label. May contain `:`.
    pub owner: String,
    /// Role claimed by the payload.
    pub role: Role,
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: u64,
}

impl QrPayload {
    /// Parses the raw text form or its base64 encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] for any malformed payload.
    pub fn parse(input: &str) -> CardKitResult<Self> {
        let input = input.trim();
        if input.starts_with(PREFIX) {
            return Self::parse_text(input);
        }
        let decoded = decode_b64url(input)
            .map_err(|_| CardKitError::InvalidInput("QR payload is neither text nor base64".to_string()))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| CardKitError::InvalidInput("QR payload is not UTF-8".to_string()))?;
        Self::parse_text(&text)
    }

    fn parse_text(text: &str) -> CardKitResult<Self> {
        let malformed = |what: &str| CardKitError::InvalidInput(format!("QR payload: {what}"));

        let rest = text.strip_prefix(PREFIX).ok_or_else(|| malformed("missing CARD"))?;
        let (card_id, rest) = rest.split_once(OWNER_SEP).ok_or_else(|| malformed("missing OWNER"))?;
        let (rest, timestamp) = rest
            .rsplit_once(TIMESTAMP_SEP)
            .ok_or_else(|| malformed("missing TIMESTAMP"))?;
        let (owner, role) = rest.rsplit_once(ROLE_SEP).ok_or_else(|| malformed("missing ROLE"))?;

        Ok(Self {
            card_id: CardId::from_b64(card_id).map_err(|_| malformed("bad card id"))?,
            owner: owner.to_string(),
            role: role.parse().map_err(|_| malformed("unknown role"))?,
            timestamp_ms: timestamp.parse().map_err(|_| malformed("bad timestamp"))?,
        })
    }

    /// URL-safe base64 of the text form.
    #[must_use]
    pub fn to_b64(&self) -> String {
        encode_b64url(self.to_string().as_bytes())
    }
}

impl fmt::Display for QrPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = self.role.to_string().to_uppercase();
        write!(
            f,
            "{PREFIX}{}{OWNER_SEP}{}{ROLE_SEP}{role}{TIMESTAMP_SEP}{}",
            self.card_id, self.owner, self.timestamp_ms
        )
    }
}
