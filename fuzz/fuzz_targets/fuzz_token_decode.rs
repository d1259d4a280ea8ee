//! Fuzz target for persisted segment token decoding.
//!
//! Tokens are read back from the token store on every pull start, so
//! decoding must never panic on corrupted rows, and anything that decodes
//! must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replay_engine::token::{SegmentToken, Token};

fuzz_target!(|data: &str| {
    // Should never panic
    let Ok(token) = SegmentToken::decode(data) else {
        return;
    };

    let encoded = token.encode().expect("decoded token must encode");
    assert_eq!(SegmentToken::decode(&encoded).ok(), Some(token));

    // Advancing to the boundary always collapses the token.
    if let Some(until) = token.replay_until() {
        assert!(!token.advance_to(until).is_replaying());
    }
    let _ = token.advance_to(Token::at_position(u64::MAX));
});
