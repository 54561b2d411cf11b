//! Text chunkers.
//!
//! Two strategies:
//!
//! - [`chunk_text`] splits long text into pieces of at most `max_tokens`
//!   (approximated at four characters per token). Splits happen on
//!   paragraph boundaries (`\n\n`); a paragraph that is too long on its own
//!   is cut at the last newline or space before the limit.
//! - [`chunk_windows`] cuts section-aware, overlapping word windows and
//!   records where each chunk sits in the source text. See
//!   [`WindowOptions`] for the rules.
//!
//! The output is deterministic, so chunk documents keep their ids across
//! re-runs.

use crate::config::WindowOptions;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into non-empty, trimmed chunks. Blank text yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut chunks);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn hard_split(mut remaining: &str, max_chars: usize, out: &mut Vec<String>) {
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            push_trimmed(remaining, out);
            break;
        }
        let mut limit = max_chars;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            // A single character wider than the limit.
            limit = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }
        let window = &remaining[..limit];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        push_trimmed(&remaining[..cut], out);
        remaining = &remaining[cut..];
    }
}

fn push_trimmed(piece: &str, out: &mut Vec<String>) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Word windows
// ═══════════════════════════════════════════════════════════════════════

/// A piece of a larger text and its position in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Heading(s) of the section(s) the chunk was cut from.
    pub section_title: Option<String>,
    pub word_count: usize,
    /// Char offsets into the source text, end exclusive.
    pub start_char: usize,
    pub end_char: usize,
    /// Words shared with the previous and next chunk.
    pub overlap_with_previous: usize,
    pub overlap_with_next: usize,
}

#[derive(Debug, Clone, Copy)]
struct Word {
    start: usize,
    end: usize,
    start_char: usize,
    end_char: usize,
}

/// Run of words `[start, end)` under one heading.
struct Section<'a> {
    title: Option<&'a str>,
    start: usize,
    end: usize,
}

/// Word range `[start, end)` that becomes one chunk.
struct Piece {
    title: Option<String>,
    start: usize,
    end: usize,
}

/// Split `text` into section-aware word windows. Blank text yields no chunks.
pub fn chunk_windows(text: &str, opts: &WindowOptions) -> Vec<Chunk> {
    let (words, sections) = split_sections(text);
    let mut pieces = Vec::new();

    if sections.iter().all(|s| s.title.is_none()) {
        for (start, end) in windows(0, words.len(), opts) {
            pieces.push(Piece { title: None, start, end });
        }
    } else {
        let mut pending: Option<Piece> = None;
        let mut pending_titles: Vec<&str> = Vec::new();
        for section in sections.iter().filter(|s| s.end > s.start) {
            if section.end - section.start < opts.min_section_words {
                let piece = pending.get_or_insert(Piece {
                    title: None,
                    start: section.start,
                    end: section.start,
                });
                piece.end = section.end;
                pending_titles.extend(section.title);
                continue;
            }
            if let Some(mut piece) = pending.take() {
                piece.title = joined_title(&mut pending_titles);
                pieces.push(piece);
            }
            let ranges = if section.end - section.start <= opts.max_section_words {
                vec![(section.start, section.end)]
            } else {
                windows(section.start, section.end, opts)
            };
            for (start, end) in ranges {
                pieces.push(Piece {
                    title: section.title.map(str::to_string),
                    start,
                    end,
                });
            }
        }
        if let Some(mut piece) = pending.take() {
            piece.title = joined_title(&mut pending_titles);
            pieces.push(piece);
        }
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            let first = words[piece.start];
            let last = words[piece.end - 1];
            let previous = i
                .checked_sub(1)
                .map_or(0, |p| pieces[p].end.saturating_sub(piece.start));
            let next = pieces
                .get(i + 1)
                .map_or(0, |n| piece.end.saturating_sub(n.start));
            Chunk {
                text: text[first.start..last.end].to_string(),
                section_title: piece.title.clone(),
                word_count: piece.end - piece.start,
                start_char: first.start_char,
                end_char: last.end_char,
                overlap_with_previous: previous,
                overlap_with_next: next,
            }
        })
        .collect()
}

fn joined_title(titles: &mut Vec<&str>) -> Option<String> {
    let title = (!titles.is_empty()).then(|| titles.join(" / "));
    titles.clear();
    title
}

/// Overlapping windows over words `[start, end)`. A run no longer than
/// `min_chunk_words` or `chunk_words` stays in one window.
fn windows(start: usize, end: usize, opts: &WindowOptions) -> Vec<(usize, usize)> {
    let len = end - start;
    if len == 0 {
        return Vec::new();
    }
    let size = opts.chunk_words.max(1);
    if len <= size.max(opts.min_chunk_words) {
        return vec![(start, end)];
    }
    let step = size.saturating_sub(opts.overlap_words).max(1);
    let mut out = Vec::new();
    let mut pos = start;
    loop {
        let stop = (pos + size).min(end);
        out.push((pos, stop));
        if stop == end {
            break;
        }
        pos += step;
    }
    if out.len() > 1 {
        if let Some(&(tail_start, tail_end)) = out.last() {
            if tail_end - tail_start < opts.min_chunk_words {
                out.pop();
                if let Some(last) = out.last_mut() {
                    last.1 = tail_end;
                }
            }
        }
    }
    out
}

/// Words of `text` plus the sections they fall in. Heading lines start a
/// new section and are not counted as words.
fn split_sections(text: &str) -> (Vec<Word>, Vec<Section<'_>>) {
    let mut words = Vec::new();
    let mut sections = vec![Section {
        title: None,
        start: 0,
        end: 0,
    }];
    let (mut byte_base, mut char_base) = (0, 0);
    for line in text.split_inclusive('\n') {
        match heading(line) {
            Some(title) => sections.push(Section {
                title: Some(title),
                start: words.len(),
                end: words.len(),
            }),
            None => {
                collect_words(line, byte_base, char_base, &mut words);
                if let Some(current) = sections.last_mut() {
                    current.end = words.len();
                }
            }
        }
        byte_base += line.len();
        char_base += line.chars().count();
    }
    (words, sections)
}

/// Title of a markdown ATX heading line (`# Title` .. `###### Title`).
fn heading(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let level = trimmed.bytes().take_while(|&b| b == b'#').count();
    if !(1..=6).contains(&level) || !trimmed[level..].starts_with(' ') {
        return None;
    }
    let title = trimmed[level..].trim();
    (!title.is_empty()).then_some(title)
}

fn collect_words(line: &str, byte_base: usize, char_base: usize, out: &mut Vec<Word>) {
    let mut current: Option<(usize, usize)> = None;
    let mut chars = 0;
    for (n, (i, c)) in line.char_indices().enumerate() {
        chars = n + 1;
        if c.is_whitespace() {
            if let Some((start, start_char)) = current.take() {
                out.push(Word {
                    start: byte_base + start,
                    end: byte_base + i,
                    start_char: char_base + start_char,
                    end_char: char_base + n,
                });
            }
        } else if current.is_none() {
            current = Some((i, n));
        }
    }
    if let Some((start, start_char)) = current {
        out.push(Word {
            start: byte_base + start,
            end: byte_base + line.len(),
            start_char: char_base + start_char,
            end_char: char_base + chars,
        });
    }
}
