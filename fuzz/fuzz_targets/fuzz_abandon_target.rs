//! Fuzz target for Abandon request decoding.
//!
//! Arbitrary content octets must decode or fail cleanly, and every value
//! that decodes must survive re-encoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ldap_core::protocol::{decode_int, encode_int, Pdu, RequestTag};

fuzz_target!(|data: &[u8]| {
    let pdu = Pdu::new(1, RequestTag::Abandon, data.to_vec());
    if let Ok(target) = pdu.abandon_target() {
        assert_eq!(decode_int(&encode_int(target)).ok(), Some(target));
    }
});
