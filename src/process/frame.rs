use super::ProcessStatus;

/// Cell color, mirroring the VT parser's palette.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    Idx(u8),
    Rgb(u8, u8, u8),
}

impl From<vt100::Color> for Color {
    fn from(color: vt100::Color) -> Self {
        match color {
            vt100::Color::Default => Color::Default,
            vt100::Color::Idx(idx) => Color::Idx(idx),
            vt100::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
        }
    }
}

/// One styled character cell of the visible grid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    /// Cell contents; empty for cells nothing has drawn to
    pub text: String,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
}

/// A rendered snapshot of the terminal, published once per generation tick.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Visible grid, row-major
    pub cells: Vec<Vec<Cell>>,
    /// Cursor (row, column)
    pub cursor: (u16, u16),
    pub cursor_visible: bool,
    /// Rows of history available above the current viewport position
    pub scrollback: usize,
    pub generation: u64,
    /// Process status at the moment of emission
    pub status: ProcessStatus,
}

impl Frame {
    /// Snapshot the parser. Takes `&mut` because measuring the scrollback
    /// depth moves the scroll position and restores it.
    pub(crate) fn capture(
        parser: &mut vt100::Parser,
        generation: u64,
        status: ProcessStatus,
    ) -> Frame {
        let scrollback = scrollback_depth(parser);

        let screen = parser.screen();
        let (rows, cols) = screen.size();
        let mut cells = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let mut line = Vec::with_capacity(cols as usize);
            for col in 0..cols {
                line.push(match screen.cell(row, col) {
                    Some(cell) => Cell {
                        text: cell.contents().to_string(),
                        fg: cell.fgcolor().into(),
                        bg: cell.bgcolor().into(),
                        bold: cell.bold(),
                        italic: cell.italic(),
                        underline: cell.underline(),
                        inverse: cell.inverse(),
                    },
                    None => Cell::default(),
                });
            }
            cells.push(line);
        }

        Frame {
            cells,
            cursor: screen.cursor_position(),
            cursor_visible: !screen.hide_cursor(),
            scrollback,
            generation,
            status,
        }
    }

    /// Plain text of one row, untouched cells rendered as spaces.
    pub fn row_text(&self, row: usize) -> String {
        self.cells
            .get(row)
            .map(|cells| {
                cells
                    .iter()
                    .map(|c| if c.text.is_empty() { " " } else { c.text.as_str() })
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .unwrap_or_default()
    }

    /// Plain text of the whole visible grid.
    pub fn text(&self) -> String {
        (0..self.cells.len())
            .map(|row| self.row_text(row))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Total rows of history in the scrollback buffer. The parser only exposes
/// the current position, so probe by scrolling to the clamp limit and
/// restoring.
pub(crate) fn scrollback_depth(parser: &mut vt100::Parser) -> usize {
    let current = parser.screen().scrollback();
    parser.screen_mut().set_scrollback(usize::MAX);
    let depth = parser.screen().scrollback();
    parser.screen_mut().set_scrollback(current);
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reflects_parser_contents_and_styles() {
        let mut parser = vt100::Parser::new(4, 20, 100);
        parser.process(b"plain \x1b[1;31mbold-red\x1b[m");

        let frame = Frame::capture(&mut parser, 7, ProcessStatus::Running);
        assert_eq!(frame.generation, 7);
        assert_eq!(frame.cells.len(), 4);
        assert_eq!(frame.cells[0].len(), 20);
        assert_eq!(frame.row_text(0), "plain bold-red");

        let bold = &frame.cells[0][6];
        assert_eq!(bold.text, "b");
        assert!(bold.bold);
        assert_eq!(bold.fg, Color::Idx(1));

        let plain = &frame.cells[0][0];
        assert!(!plain.bold);
        assert_eq!(plain.fg, Color::Default);
    }

    #[test]
    fn capture_tracks_cursor() {
        let mut parser = vt100::Parser::new(4, 20, 0);
        parser.process(b"ab");
        let frame = Frame::capture(&mut parser, 1, ProcessStatus::Running);
        assert_eq!(frame.cursor, (0, 2));
        assert!(frame.cursor_visible);

        parser.process(b"\x1b[?25l");
        let frame = Frame::capture(&mut parser, 2, ProcessStatus::Running);
        assert!(!frame.cursor_visible);
    }

    #[test]
    fn scrollback_depth_counts_scrolled_off_rows() {
        let mut parser = vt100::Parser::new(4, 20, 100);
        for i in 0..10 {
            parser.process(format!("line {i}\r\n").as_bytes());
        }
        // 11 rows entered a 4-row screen; 7 scrolled into history.
        assert_eq!(scrollback_depth(&mut parser), 7);
        // The probe must not move the viewport.
        assert_eq!(parser.screen().scrollback(), 0);
    }
}
