//! A fixed-size text buffer with a cursor.
//!
//! Just enough of a terminal for the executor to render failures on and for
//! the computer façade to report changes from. No palette, no rendering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct Terminal {
    width: usize,
    height: usize,
    colour: bool,
    state: Mutex<TermState>,
    changed: AtomicBool,
}

struct TermState {
    lines: Vec<Vec<u8>>,
    cursor_x: i32,
    cursor_y: i32,
}

impl Terminal {
    pub fn new(width: usize, height: usize, colour: bool) -> Self {
        let lines = (0..height).map(|_| vec![b' '; width]).collect();
        Terminal {
            width,
            height,
            colour,
            state: Mutex::new(TermState { lines, cursor_x: 0, cursor_y: 0 }),
            changed: AtomicBool::new(false),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_colour(&self) -> bool {
        self.colour
    }

    /// Clear the buffer and home the cursor.
    pub fn reset(&self) {
        let mut state = self.lock();
        for line in &mut state.lines {
            line.fill(b' ');
        }
        state.cursor_x = 0;
        state.cursor_y = 0;
        drop(state);
        self.mark_changed();
    }

    pub fn set_cursor_pos(&self, x: i32, y: i32) {
        let mut state = self.lock();
        if state.cursor_x != x || state.cursor_y != y {
            state.cursor_x = x;
            state.cursor_y = y;
            drop(state);
            self.mark_changed();
        }
    }

    pub fn cursor_pos(&self) -> (i32, i32) {
        let state = self.lock();
        (state.cursor_x, state.cursor_y)
    }

    /// Write text at the cursor, clipping to the buffer and advancing the
    /// cursor past what was written. Non-ASCII bytes render as `?`.
    pub fn write(&self, text: &str) {
        let mut state = self.lock();
        let y = state.cursor_y;
        let start = state.cursor_x;
        if y >= 0 && (y as usize) < self.height {
            for (i, ch) in text.chars().enumerate() {
                let x = start + i as i32;
                if x < 0 {
                    continue;
                }
                let x = x as usize;
                if x >= self.width {
                    break;
                }
                let byte = if ch.is_ascii() && !ch.is_control() { ch as u8 } else { b'?' };
                state.lines[y as usize][x] = byte;
            }
        }
        state.cursor_x = start + text.chars().count() as i32;
        drop(state);
        self.mark_changed();
    }

    /// Scroll the buffer up by `lines` rows, filling the bottom with blanks.
    pub fn scroll(&self, lines: usize) {
        if lines == 0 {
            return;
        }
        let mut state = self.lock();
        if lines >= self.height {
            for line in &mut state.lines {
                line.fill(b' ');
            }
        } else {
            state.lines.rotate_left(lines);
            let height = self.height;
            for line in &mut state.lines[height - lines..] {
                line.fill(b' ');
            }
        }
        drop(state);
        self.mark_changed();
    }

    /// The contents of row `y`, trailing spaces included.
    pub fn line(&self, y: usize) -> String {
        let state = self.lock();
        state
            .lines
            .get(y)
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .unwrap_or_default()
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Take the changed flag, resetting it.
    pub fn poll_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TermState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_clips_to_bounds() {
        let term = Terminal::new(8, 2, false);
        term.set_cursor_pos(6, 0);
        term.write("hello");
        assert_eq!(term.line(0), "      he");
        assert_eq!(term.cursor_pos(), (11, 0));
    }

    #[test]
    fn reset_clears_and_homes() {
        let term = Terminal::new(4, 2, false);
        term.write("abcd");
        term.reset();
        assert_eq!(term.line(0), "    ");
        assert_eq!(term.cursor_pos(), (0, 0));
    }

    #[test]
    fn scroll_moves_lines_up() {
        let term = Terminal::new(3, 3, false);
        term.set_cursor_pos(0, 0);
        term.write("one");
        term.set_cursor_pos(0, 1);
        term.write("two");
        term.scroll(1);
        assert_eq!(term.line(0), "two");
        assert_eq!(term.line(2), "   ");
    }

    #[test]
    fn poll_changed_resets() {
        let term = Terminal::new(2, 1, false);
        assert!(!term.poll_changed());
        term.write("x");
        assert!(term.poll_changed());
        assert!(!term.poll_changed());
    }
}
