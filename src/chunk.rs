//! Outbound reply chunking and paced delivery.
//!
//! A reply is split into fragments on blank-line paragraph boundaries first,
//! then on sentence boundaries for paragraphs that are still too long.
//! Fragments are delivered one at a time with a pacing delay in between.

use crate::error::{Error, MessagingError, Result};

use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

/// Sentence-ending punctuation followed by whitespace.
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("hardcoded sentence boundary regex"));

/// One platform-deliverable piece of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    /// A single sentence longer than the requested maximum. Emitted whole
    /// rather than truncated.
    pub oversized: bool,
}

impl Fragment {
    fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            oversized: false,
        }
    }

    fn oversized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            oversized: true,
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        char_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` into fragments of at most `max_length` characters.
///
/// Only a sentence that alone exceeds `max_length` may produce a longer
/// fragment, and that fragment is marked [`Fragment::oversized`].
pub fn chunk(text: &str, max_length: usize) -> Vec<Fragment> {
    let trimmed = text.trim();
    if char_len(trimmed) <= max_length {
        return vec![Fragment::new(trimmed)];
    }

    let mut fragments = Vec::new();
    for paragraph in text
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
    {
        if char_len(paragraph) <= max_length {
            fragments.push(Fragment::new(paragraph));
        } else {
            pack_sentences(paragraph, max_length, &mut fragments);
        }
    }

    fragments
}

/// Split a paragraph into trimmed sentences, punctuation kept with its sentence.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for boundary in SENTENCE_BOUNDARY.find_iter(paragraph) {
        // The punctuation mark is a single ASCII byte.
        let end = boundary.start() + 1;
        let sentence = paragraph[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = boundary.end();
    }

    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
}

/// Greedily pack consecutive sentences into fragments no longer than `max_length`.
fn pack_sentences(paragraph: &str, max_length: usize, fragments: &mut Vec<Fragment>) {
    let mut current = String::new();
    let mut current_len = 0;

    for sentence in split_sentences(paragraph) {
        let sentence_len = char_len(sentence);

        if sentence_len > max_length {
            if !current.is_empty() {
                fragments.push(Fragment::new(std::mem::take(&mut current)));
                current_len = 0;
            }
            fragments.push(Fragment::oversized(sentence));
            continue;
        }

        if current.is_empty() {
            current.push_str(sentence);
            current_len = sentence_len;
        } else if current_len + 1 + sentence_len <= max_length {
            current.push(' ');
            current.push_str(sentence);
            current_len += 1 + sentence_len;
        } else {
            fragments.push(Fragment::new(std::mem::take(&mut current)));
            current.push_str(sentence);
            current_len = sentence_len;
        }
    }

    if !current.is_empty() {
        fragments.push(Fragment::new(current));
    }
}

/// Send fragments in order, sleeping `pacing` between consecutive sends.
///
/// Stops at the first failed send. Fragments after the failure are never
/// passed to `send`, and the failed one is not retried. Returns the number of
/// fragments delivered.
pub async fn deliver<F, Fut>(fragments: &[Fragment], mut send: F, pacing: Duration) -> Result<usize>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let total = fragments.len();

    for (index, fragment) in fragments.iter().enumerate() {
        if index > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }

        if let Err(error) = send(fragment.text.clone()).await {
            return Err(Error::Messaging(MessagingError::DeliveryFailed {
                delivered: index,
                total,
                source: Box::new(error),
            }));
        }
    }

    Ok(total)
}

/// Hard-split text for platforms that reject messages over `max_length`.
///
/// Tries to split at newlines, then spaces, then cuts at a char boundary.
/// Only whitespace at the split points is lost.
pub fn split_oversized(text: &str, max_length: usize) -> Vec<String> {
    if max_length == 0 || char_len(text) <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_length) else {
            chunks.push(remaining.to_string());
            break;
        };

        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .filter(|&index| index > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn texts(fragments: &[Fragment]) -> Vec<&str> {
        fragments.iter().map(|f| f.text.as_str()).collect()
    }

    fn non_whitespace(text: &str) -> String {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn short_text_is_returned_trimmed() {
        let fragments = chunk("  hello there \n", 50);
        assert_eq!(fragments, vec![Fragment::new("hello there")]);
    }

    #[test]
    fn text_at_exact_limit_is_not_split() {
        let text = "a".repeat(10);
        assert_eq!(texts(&chunk(&text, 10)), vec![text.as_str()]);
    }

    #[test]
    fn paragraphs_become_separate_fragments() {
        let text = "First paragraph.\n\n\n\nSecond one here.\n\n   \n\nThird.";
        let fragments = chunk(text, 20);
        assert_eq!(
            texts(&fragments),
            vec!["First paragraph.", "Second one here.", "Third."]
        );
        assert!(fragments.iter().all(|f| !f.oversized));
    }

    #[test]
    fn long_paragraph_is_packed_by_sentence() {
        let text = "One two three. Four five six! Seven eight nine? Ten.";
        let fragments = chunk(text, 30);
        assert_eq!(
            texts(&fragments),
            vec!["One two three. Four five six!", "Seven eight nine? Ten."]
        );
        assert!(fragments.iter().all(|f| f.len() <= 30));
    }

    #[test]
    fn oversized_sentence_is_flagged_not_truncated() {
        let long = format!("{}.", "x".repeat(40));
        let text = format!("Short one. {long} Tail here.");
        let fragments = chunk(&text, 20);

        assert_eq!(texts(&fragments), vec!["Short one.", long.as_str(), "Tail here."]);
        assert_eq!(
            fragments.iter().map(|f| f.oversized).collect::<Vec<_>>(),
            vec![false, true, false]
        );
    }

    #[test]
    fn punctuation_without_whitespace_is_not_a_boundary() {
        assert_eq!(
            split_sentences("Rates rose 2.5% today. Fine"),
            vec!["Rates rose 2.5% today.", "Fine"]
        );
    }

    #[test]
    fn multibyte_text_is_measured_in_characters() {
        let text = "बचत करो। ₹₹₹₹₹ ₹₹₹₹₹. अगला वाक्य!";
        let fragments = chunk(text, 12);
        for fragment in &fragments {
            assert!(fragment.oversized || fragment.len() <= 12, "{fragment:?}");
        }
        assert_eq!(
            non_whitespace(&fragments.iter().map(|f| f.text.as_str()).collect::<String>()),
            non_whitespace(text)
        );
    }

    #[test]
    fn content_is_preserved_across_fragments() {
        let text = "Budgeting matters. Start with a plan!\n\nSave first, spend later. \
                    Track every rupee? Yes. Review monthly.\n\nInvest for the long run.";
        for max_length in [5, 12, 25, 40, 80, 500] {
            let fragments = chunk(text, max_length);
            let joined: String = fragments.iter().map(|f| f.text.as_str()).collect();
            assert_eq!(non_whitespace(&joined), non_whitespace(text), "max_length={max_length}");
            for fragment in &fragments {
                assert!(fragment.oversized || fragment.len() <= max_length);
                assert!(!fragment.is_empty());
            }
        }
    }

    #[test]
    fn long_reply_splits_second_paragraph_at_sentences() {
        let first = "x".repeat(3000);
        let mut second = String::new();
        let mut index = 0;
        while second.chars().count() < 6000 {
            if !second.is_empty() {
                second.push(' ');
            }
            second.push_str(&format!("Sentence {index:04} keeps the budget honest."));
            index += 1;
        }
        let text = format!("{first}\n\n{second}");
        assert!(text.chars().count() >= 9000);

        let fragments = chunk(&text, 4096);

        assert!(fragments.len() >= 3);
        assert_eq!(fragments[0].text, first);
        for fragment in &fragments {
            assert!(!fragment.oversized);
            assert!(fragment.len() <= 4096);
        }
        let rest: String = fragments[1..].iter().map(|f| f.text.as_str()).collect();
        assert_eq!(non_whitespace(&rest), non_whitespace(&second));
        assert!(fragments[1].text.ends_with('.'));
    }

    #[test]
    fn split_oversized_prefers_whitespace() {
        let chunks = split_oversized("aaaa bbbb\ncccc dddd", 10);
        assert_eq!(chunks, vec!["aaaa bbbb", "cccc dddd"]);
    }

    #[test]
    fn split_oversized_hard_cuts_unbroken_text() {
        let chunks = split_oversized(&"₹".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), "₹".repeat(25));
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_sends_in_order_with_pacing() {
        let fragments = chunk("One.\n\nTwo.\n\nThree.", 5);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let recorder = sent.clone();
        let delivered = deliver(
            &fragments,
            move |text| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push((text, started.elapsed()));
                    Ok::<(), Error>(())
                }
            },
            Duration::from_millis(300),
        )
        .await;

        tokio_test::assert_ok!(&delivered);
        assert_eq!(delivered.unwrap(), 3);

        let sent = sent.lock().unwrap();
        let order: Vec<&str> = sent.iter().map(|(text, _)| text.as_str()).collect();
        assert_eq!(order, vec!["One.", "Two.", "Three."]);
        assert_eq!(sent[0].1, Duration::ZERO);
        assert!(sent[1].1 >= Duration::from_millis(300));
        assert!(sent[2].1 >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_halts_on_first_failure() {
        let fragments = chunk("One.\n\nTwo.\n\nThree.", 5);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let recorder = calls.clone();
        let result = deliver(
            &fragments,
            move |text| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(text.clone());
                    if text == "Two." {
                        Err(Error::from(anyhow::anyhow!("platform rejected message")))
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_millis(300),
        )
        .await;

        assert_eq!(*calls.lock().unwrap(), vec!["One.", "Two."]);
        match result {
            Err(Error::Messaging(MessagingError::DeliveryFailed {
                delivered, total, ..
            })) => {
                assert_eq!(delivered, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected delivery failure, got {other:?}"),
        }
    }
}
