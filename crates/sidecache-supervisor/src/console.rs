use std::collections::VecDeque;

/// Bounded ring of the managed service's console lines, sequence-numbered so
/// operators can poll incrementally without missing or repeating lines.
#[derive(Debug)]
pub struct ConsoleBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Lines strictly after `cursor`, up to `limit`, plus the new cursor.
    /// Cursor 0 means "the most recent `limit` lines".
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Strips ANSI escape sequences (CSI and the rare lone ESC forms) so the
/// readiness marker matches regardless of the service's color output.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ params... final byte in 0x40..=0x7e
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            // Two-character escape (e.g. ESC c); swallow the follower.
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        let line = "\u{1b}[32mReady\u{1b}[0m to accept connections";
        assert_eq!(strip_ansi(line), "Ready to accept connections");
    }

    #[test]
    fn strip_ansi_leaves_plain_text_alone() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }

    #[test]
    fn strip_ansi_handles_trailing_escape() {
        assert_eq!(strip_ansi("tail\u{1b}"), "tail");
    }

    #[test]
    fn buffer_evicts_oldest() {
        let mut buf = ConsoleBuffer::new(2);
        buf.push_line("a".to_string());
        buf.push_line("b".to_string());
        buf.push_line("c".to_string());
        let (lines, cursor) = buf.tail_after(0, 10);
        assert_eq!(lines, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(cursor, 3);
    }

    #[test]
    fn tail_after_resumes_from_cursor() {
        let mut buf = ConsoleBuffer::new(10);
        for i in 0..5 {
            buf.push_line(format!("line {i}"));
        }
        let (first, cursor) = buf.tail_after(0, 2);
        assert_eq!(first.len(), 2);
        let (rest, _) = buf.tail_after(cursor, 10);
        assert!(rest.is_empty());

        let (from_two, cursor) = buf.tail_after(2, 10);
        assert_eq!(from_two.len(), 3);
        assert_eq!(cursor, 5);
    }
}
