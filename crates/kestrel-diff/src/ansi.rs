//! Removal of terminal control sequences from captured process output.
//!
//! Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`), charset selection
//! (`ESC ( X`, `ESC ) X`) and two-byte `ESC X` sequences in a single linear pass. Unterminated
//! sequences swallow the rest of the input.

const ESC: char = '\u{1b}';
const BEL: char = '\u{7}';

/// Strip control sequences and carriage returns that are not part of a `\r\n` pair.
#[must_use]
pub fn strip(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESC => match chars.next() {
                Some('[') => {
                    // parameter and intermediate bytes run until a final byte in 0x40..=0x7E
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == BEL {
                            break;
                        }
                        if c == ESC && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(' | ')') => {
                    chars.next();
                }
                Some(_) | None => {}
            },
            '\r' if chars.peek() != Some(&'\n') => {}
            _ => out.push(c),
        }
    }

    out
}

/// [`strip`] followed by `\r\n` → `\n`.
#[must_use]
pub fn strip_and_normalize(text: &str) -> String {
    strip(text).replace("\r\n", "\n")
}
