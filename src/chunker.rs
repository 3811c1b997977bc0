/// Text chunking for embedding.
///
/// Splits text into overlapping windows on natural boundaries, recursing
/// from paragraphs down to sentences, words, and finally raw characters
/// when a single unit exceeds the window size. Windows produced by actual
/// splitting are dropped when shorter than `MIN_CHUNK_LEN`; survivors are
/// renumbered contiguously from zero.
///
/// All sizes are in `char`s, not bytes, so multi-byte text splits cleanly.

/// Minimum length of a window produced by splitting. Text that fits in a
/// single window is kept regardless (a short snippet is still one chunk).
const MIN_CHUNK_LEN: usize = 50;

/// Characters treated as sentence boundaries.
const SENTENCE_BOUNDARIES: &[char] = &['.', '!', '?', '。', '\n'];

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    #[must_use]
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        debug_assert!(overlap < chunk_size);
        Self {
            chunk_size,
            overlap,
        }
    }

    /// Split `text` into indexed chunks. Empty input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        // Fits in one window: no splitting, no minimum-length filter.
        if char_len(trimmed) <= self.chunk_size {
            return vec![Chunk {
                index: 0,
                text: trimmed.to_string(),
            }];
        }

        self.split_paragraphs(trimmed)
            .into_iter()
            .map(|w| w.trim().to_string())
            .filter(|w| char_len(w) >= MIN_CHUNK_LEN)
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect()
    }

    fn split_paragraphs(&self, text: &str) -> Vec<String> {
        let paragraphs = text.split("\n\n").map(str::trim).filter(|p| !p.is_empty());
        self.pack(paragraphs, "\n\n", |p| self.split_sentences(p))
    }

    fn split_sentences(&self, text: &str) -> Vec<String> {
        let sentences = text
            .split_inclusive(SENTENCE_BOUNDARIES)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        self.pack(sentences, " ", |s| self.split_words(s))
    }

    fn split_words(&self, text: &str) -> Vec<String> {
        self.pack(text.split_whitespace(), " ", |w| self.split_chars(w))
    }

    /// Last resort: fixed-size character windows advancing by
    /// `chunk_size - overlap`.
    fn split_chars(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            windows.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        windows
    }

    /// Pack pieces into windows of at most `chunk_size` chars joined by
    /// `joiner`, carrying an overlap tail from each flushed window into the
    /// next. Pieces that alone exceed the window size are handed to
    /// `split_oversized` and their windows emitted as-is.
    fn pack<'a, I>(
        &self,
        pieces: I,
        joiner: &str,
        split_oversized: impl Fn(&str) -> Vec<String>,
    ) -> Vec<String>
    where
        I: Iterator<Item = &'a str>,
    {
        let joiner_len = char_len(joiner);
        let mut windows = Vec::new();
        let mut current = String::new();

        for piece in pieces {
            let piece_len = char_len(piece);

            if piece_len > self.chunk_size {
                if !current.is_empty() {
                    windows.push(std::mem::take(&mut current));
                }
                windows.extend(split_oversized(piece));
                continue;
            }

            let current_len = char_len(&current);
            if current_len > 0 && current_len + joiner_len + piece_len > self.chunk_size {
                let tail = self.overlap_tail(&current);
                windows.push(std::mem::take(&mut current));
                // Skip the tail when it would overflow the next window.
                if char_len(&tail) + joiner_len + piece_len <= self.chunk_size {
                    current = tail;
                }
            }

            if !current.is_empty() {
                current.push_str(joiner);
            }
            current.push_str(piece);
        }

        if !current.is_empty() {
            windows.push(current);
        }
        windows
    }

    /// The trailing `overlap` chars of a window, advanced to the next word
    /// boundary so the next window does not open mid-word.
    fn overlap_tail(&self, window: &str) -> String {
        if self.overlap == 0 {
            return String::new();
        }
        let chars: Vec<char> = window.chars().collect();
        if chars.len() <= self.overlap {
            return window.to_string();
        }
        let mut start = chars.len() - self.overlap;
        while start < chars.len() && !chars[start].is_whitespace() {
            start += 1;
        }
        chars[start..].iter().collect::<String>().trim().to_string()
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(500, 50)
    }

    #[test]
    fn test_empty_text() {
        assert!(chunker().chunk("").is_empty());
    }

    #[test]
    fn test_whitespace_only() {
        assert!(chunker().chunk("   \n\n   \n\n   ").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunker().chunk("API documentation for REST endpoints.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "API documentation for REST endpoints.");
    }

    #[test]
    fn test_indices_contiguous_from_zero() {
        let para = "A sentence about retrieval systems and ranking. ".repeat(20);
        let content = vec![para; 5].join("\n\n");
        let chunks = chunker().chunk(&content);

        assert!(chunks.len() >= 2);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(chunk.text.chars().count() >= MIN_CHUNK_LEN);
        }
    }

    #[test]
    fn test_windows_respect_target_size() {
        let para = "Some words that will need splitting into many pieces. ".repeat(40);
        let chunks = chunker().chunk(&para);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            // Sentence packing never exceeds the window target.
            assert!(chunk.text.chars().count() <= 500, "{}", chunk.text.len());
        }
    }

    #[test]
    fn test_consecutive_windows_overlap() {
        let chunker = Chunker::new(100, 30);
        let text = "word ".repeat(200);
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() >= 2);
        // The tail of each window reappears at the head of the next.
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].text.chars().rev().take(10).collect();
            let tail: String = prev_tail.chars().rev().collect();
            assert!(
                pair[1].text.contains(tail.trim()),
                "no overlap between consecutive windows"
            );
        }
    }

    #[test]
    fn test_oversized_word_char_split() {
        let chunker = Chunker::new(100, 20);
        let giant = "x".repeat(350);
        let chunks = chunker.chunk(&giant);

        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 100);
        }
    }

    #[test]
    fn test_multibyte_text_splits_cleanly() {
        let chunker = Chunker::new(120, 20);
        let text = "これは日本語の文章です。".repeat(60);
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
            assert!(chunk.text.chars().count() <= 120);
        }
    }

    #[test]
    fn test_degenerate_windows_dropped() {
        // A long text whose tail paragraph is tiny: the tiny window must
        // be filtered out and the survivors renumbered.
        let big = "A reasonably sized sentence for the test corpus here. ".repeat(20);
        let text = format!("{big}\n\nok");
        let chunks = chunker().chunk(&text);

        assert!(!chunks.is_empty());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_ne!(chunk.text, "ok");
        }
    }
}
