//! Low-signal chat detection.
//!
//! Acknowledgements, greetings, thanks, and farewells get a canned reply
//! without invoking retrieval or the LLM. A message is low-signal when it
//! is short, has no digits, no question mark, and every word comes from a
//! fixed acknowledgement set.

use std::collections::HashSet;
use std::sync::OnceLock;

fn ack_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "ok", "okay", "k", "kk", "alright", "sure", "sounds", "good", "cool", "great",
            "perfect", "awesome", "nice", "fine", "got", "it", "understood", "yep", "yes", "no",
            "thanks", "thank", "you", "thx", "appreciate", "appreciated", "hi", "hello", "hey",
            "bye", "goodbye", "later", "cheers",
        ]
        .into_iter()
        .collect()
    })
}

const GREETING_WORDS: &[&str] = &["hi", "hello", "hey"];
const THANKS_WORDS: &[&str] = &["thanks", "thank", "thx", "appreciate", "appreciated"];
const FAREWELL_WORDS: &[&str] = &["bye", "goodbye", "later", "cheers"];

/// Whether a message is a low-signal acknowledgement.
#[must_use]
pub fn is_low_signal(message: &str) -> bool {
    let msg = message.trim().to_lowercase();
    if msg.is_empty() || msg.len() > 50 {
        return false;
    }
    if msg.contains('?') {
        return false;
    }
    if msg.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }

    let normalized: String = msg
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let words: Vec<&str> = normalized.split_whitespace().collect();
    if words.is_empty() {
        return false;
    }
    words.iter().all(|w| ack_words().contains(w))
}

/// Canned response for a low-signal message, differentiated by flavor.
#[must_use]
pub fn canned_response(message: &str) -> &'static str {
    let msg = message.trim().to_lowercase();
    if THANKS_WORDS.iter().any(|w| msg.contains(w)) {
        return "You're welcome! Let me know if you'd like me to analyze anything else.";
    }
    if FAREWELL_WORDS.iter().any(|w| msg.contains(w)) {
        return "Got it. If you need anything else, just ask.";
    }
    if GREETING_WORDS.iter().any(|w| msg.contains(w)) {
        return "Hi! What would you like to know about these documents?";
    }
    "Okay. Let me know if you'd like anything else."
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ok"; "bare ok")]
    #[test_case("thanks!"; "thanks with punctuation")]
    #[test_case("sounds good"; "two ack words")]
    #[test_case("OK great"; "mixed case")]
    fn test_low_signal(message: &str) {
        assert!(is_low_signal(message));
    }

    #[test_case("what is the cap rate?"; "question")]
    #[test_case("ok but what about revenue"; "ack plus content")]
    #[test_case("show me 2023 figures"; "digits")]
    #[test_case(""; "empty")]
    #[test_case("thanks, can you also compare the two decks"; "thanks plus request")]
    fn test_not_low_signal(message: &str) {
        assert!(!is_low_signal(message));
    }

    #[test]
    fn test_long_message_not_low_signal() {
        let message = "ok ".repeat(30);
        assert!(!is_low_signal(&message));
    }

    #[test]
    fn test_canned_response_flavors() {
        assert!(canned_response("thanks").contains("welcome"));
        assert!(canned_response("bye").contains("Got it"));
        assert!(canned_response("hello").contains("Hi!"));
        assert!(canned_response("ok").starts_with("Okay."));
    }
}
