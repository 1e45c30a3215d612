//! Tag derivation shared by the code generator and the verifier.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encoding::{counter_to_le, NONCE_LEN, TAG_LEN};
use crate::primitives::{CardId, CardSecret, Tag};

type HmacSha256 = Hmac<Sha256>;

const COUNTER_KEY_LABEL: &[u8] = b"ctr";

/// Door and nonce a door-bound code is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorBinding {
    /// Door identifier, big-endian on the wire.
    pub door_id: u32,
    /// Fresh random per-presentation nonce.
    pub nonce: [u8; NONCE_LEN],
}

fn keyed(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(key).expect("HMAC accepts any key length")
}

fn truncate(mac: HmacSha256) -> Tag {
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    Tag::new(tag)
}

/// `Trunc16(HMAC(K_master, cardId || LE64(ctr)))`.
#[must_use]
pub fn basic_tag(secret: &CardSecret, card_id: &CardId, counter: u64) -> Tag {
    let mut mac = keyed(secret.as_bytes());
    mac.update(card_id.as_bytes());
    mac.update(&counter_to_le(counter));
    truncate(mac)
}

/// `K_ctr = HMAC(K_master, "ctr" || LE64(ctr))`.
#[must_use]
pub fn derive_counter_key(secret: &CardSecret, counter: u64) -> Zeroizing<[u8; 32]> {
    let mut mac = keyed(secret.as_bytes());
    mac.update(COUNTER_KEY_LABEL);
    mac.update(&counter_to_le(counter));
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&mac.finalize().into_bytes());
    key
}

/// `Trunc16(HMAC(K_ctr, cardId || BE32(doorId) || nonce || LE64(ctr)))`.
#[must_use]
pub fn door_bound_tag(
    secret: &CardSecret,
    card_id: &CardId,
    counter: u64,
    binding: &DoorBinding,
) -> Tag {
    let counter_key = derive_counter_key(secret, counter);
    let mut mac = keyed(counter_key.as_ref());
    mac.update(card_id.as_bytes());
    mac.update(&binding.door_id.to_be_bytes());
    mac.update(&binding.nonce);
    mac.update(&counter_to_le(counter));
    truncate(mac)
}

/// Derives the tag for either scheme: door-bound when a binding is given.
#[must_use]
pub fn derive_tag(
    secret: &CardSecret,
    card_id: &CardId,
    counter: u64,
    binding: Option<&DoorBinding>,
) -> Tag {
    match binding {
        Some(binding) => door_bound_tag(secret, card_id, counter, binding),
        None => basic_tag(secret, card_id, counter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (CardSecret, CardId) {
        (CardSecret::from_bytes([0x11; 32]), CardId::new([0x22; 16]))
    }

    #[test]
    fn test_basic_tag_is_truncated_hmac() {
        let (secret, card_id) = fixture();
        let mut mac = HmacSha256::new_from_slice(&[0x11; 32]).expect("key");
        mac.update(&[0x22; 16]);
        mac.update(&[5, 0, 0, 0, 0, 0, 0, 0]);
        let full = mac.finalize().into_bytes();

        let tag = basic_tag(&secret, &card_id, 5);
        assert_eq!(tag.as_bytes()[..], full[..16]);
    }

    #[test]
    fn test_tag_depends_on_counter_and_card() {
        let (secret, card_id) = fixture();
        assert_ne!(basic_tag(&secret, &card_id, 1), basic_tag(&secret, &card_id, 2));
        assert_ne!(
            basic_tag(&secret, &card_id, 1),
            basic_tag(&secret, &CardId::new([0x23; 16]), 1)
        );
    }

    #[test]
    fn test_door_bound_tag_is_bound_to_door_and_nonce() {
        let (secret, card_id) = fixture();
        let door_a = DoorBinding {
            door_id: 1,
            nonce: [9; NONCE_LEN],
        };
        let door_b = DoorBinding { door_id: 2, ..door_a };
        let other_nonce = DoorBinding {
            nonce: [8; NONCE_LEN],
            ..door_a
        };

        let tag = door_bound_tag(&secret, &card_id, 7, &door_a);
        assert_ne!(tag, door_bound_tag(&secret, &card_id, 7, &door_b));
        assert_ne!(tag, door_bound_tag(&secret, &card_id, 7, &other_nonce));
        assert_ne!(tag, basic_tag(&secret, &card_id, 7));
        assert_eq!(tag, derive_tag(&secret, &card_id, 7, Some(&door_a)));
    }

    #[test]
    fn test_counter_keys_differ_per_counter() {
        let (secret, _) = fixture();
        assert_ne!(
            *derive_counter_key(&secret, 1),
            *derive_counter_key(&secret, 2)
        );
    }
}
