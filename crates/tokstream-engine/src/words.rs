//! Incremental word segmentation of generated text.
//!
//! A word is a maximal run of non-delimiter characters, or a single delimiter
//! character on its own. The trailing run is held back until a delimiter
//! follows it or the run finishes, so every emitted word is final.

/// Characters that end a word and form words of their own.
pub const WORD_DELIMITERS: [char; 10] = [' ', '.', ',', ':', ';', '"', '“', '?', '!', '\n'];

pub fn is_delimiter(ch: char) -> bool {
    WORD_DELIMITERS.contains(&ch)
}

/// Lazy iterator over the words of a string.
#[derive(Debug, Clone)]
pub struct SplitWords<'a> {
    rest: &'a str,
}

/// Split `text` into words, including a possibly incomplete trailing one.
pub fn split_words(text: &str) -> SplitWords<'_> {
    SplitWords { rest: text }
}

impl<'a> Iterator for SplitWords<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.rest.chars().next()?;
        let end = if is_delimiter(first) {
            first.len_utf8()
        } else {
            self.rest.find(is_delimiter).unwrap_or(self.rest.len())
        };
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }
}

/// Tracks which words of a growing text have already been emitted.
#[derive(Debug, Clone, Default)]
pub struct WordSegmenter {
    /// Byte offset just past the last emitted word.
    emitted_to: usize,
    words: Vec<String>,
}

impl WordSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.emitted_to = 0;
        self.words.clear();
    }

    /// Every word emitted so far.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Re-segment `text` (which must extend the text seen so far) and return
    /// the newly completed words. With `finished`, the trailing word is
    /// complete by definition.
    pub fn update(&mut self, text: &str, finished: bool) -> Vec<String> {
        let Some(tail) = text.get(self.emitted_to..) else {
            return Vec::new();
        };

        let mut fresh = Vec::new();
        let mut consumed = 0;
        for word in split_words(tail) {
            let ends_text = consumed + word.len() == tail.len();
            let complete = !ends_text || finished || word.chars().all(is_delimiter);
            if !complete {
                break;
            }
            consumed += word.len();
            fresh.push(word.to_string());
        }

        self.emitted_to += consumed;
        self.words.extend(fresh.iter().cloned());
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters_are_words_of_their_own() {
        let words: Vec<&str> = split_words("Hi, there!\n").collect();
        assert_eq!(words, vec!["Hi", ",", " ", "there", "!", "\n"]);
    }

    #[test]
    fn consecutive_delimiters_split_individually() {
        let words: Vec<&str> = split_words("a  b").collect();
        assert_eq!(words, vec!["a", " ", " ", "b"]);
    }

    #[test]
    fn curly_quote_is_a_delimiter() {
        let words: Vec<&str> = split_words("“yes").collect();
        assert_eq!(words, vec!["“", "yes"]);
    }

    #[test]
    fn empty_text_has_no_words() {
        assert_eq!(split_words("").count(), 0);
        assert!(WordSegmenter::new().update("", true).is_empty());
    }

    #[test]
    fn trailing_word_withheld_until_complete() {
        let mut seg = WordSegmenter::new();
        assert_eq!(seg.update("Once up", false), vec!["Once", " "]);
        assert!(seg.update("Once upon", false).is_empty());
        assert_eq!(seg.update("Once upon ", false), vec!["upon", " "]);
        assert_eq!(seg.update("Once upon a", true), vec!["a"]);
        assert_eq!(seg.words(), ["Once", " ", "upon", " ", "a"]);
    }

    #[test]
    fn resegmenting_is_idempotent() {
        let mut seg = WordSegmenter::new();
        seg.update("The cat sat.", false);
        let before = seg.words().to_vec();
        assert!(seg.update("The cat sat.", false).is_empty());
        let fresh = seg.update("The cat sat. It", true);
        assert_eq!(&seg.words()[..before.len()], &before[..]);
        assert_eq!(fresh, vec![" ", "It"]);
    }

    #[test]
    fn reset_starts_over() {
        let mut seg = WordSegmenter::new();
        seg.update("one two", true);
        seg.reset();
        assert!(seg.words().is_empty());
        assert_eq!(seg.update("x.", false), vec!["x", "."]);
    }
}
