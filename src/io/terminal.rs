//! Terminal display and operator keyboard input
//!
//! One panel per camera (latest annotated frame drawn with half-block
//! cells, sequence, size, recognized labels), the slot table below, and a
//! key legend. Keys:
//! - `q` / `Esc` / `Ctrl-C` - stop every camera
//! - `1`..`9` - release that slot (up to nine slots)
//! - digits then `Enter` - release that slot (more than nine slots)

use crate::domain::types::{CameraId, SlotNumber, SlotStatus};
use crate::services::allocator::SlotTable;
use crate::services::camera_worker::AnnotatedFrame;
use crate::services::display::{OperatorCommand, OperatorInput, Renderer};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tracing::warn;

/// Bound on the per-camera frame kept for drawing
const THUMBNAIL_MAX: (u32, u32) = (160, 96);

/// Longest slot number accepted from the keyboard
const MAX_SLOT_DIGITS: usize = 4;

#[derive(Debug, Default, Clone)]
struct CameraView {
    sequence: u64,
    width: u32,
    height: u32,
    labels: Vec<(String, bool)>,
    /// Annotated frame, shrunk to at most `THUMBNAIL_MAX`
    thumbnail: Option<RgbImage>,
    closed: bool,
}

#[derive(Debug, Default)]
struct ViewState {
    site_id: String,
    cameras: BTreeMap<CameraId, CameraView>,
    table: SlotTable,
}

impl ViewState {
    fn record_frame(&mut self, frame: &AnnotatedFrame) {
        let view = self.cameras.entry(frame.camera_id).or_default();
        view.sequence = frame.sequence;
        view.width = frame.image.width();
        view.height = frame.image.height();
        view.labels = frame.labels.iter().map(|l| (l.text.clone(), l.registered)).collect();

        let (max_w, max_h) = THUMBNAIL_MAX;
        view.thumbnail = Some(if view.width > max_w || view.height > max_h {
            let (w, h) = fit_within(view.width, view.height, max_w, max_h);
            imageops::thumbnail(&frame.image, w, h)
        } else {
            frame.image.clone()
        });
    }
}

/// Largest `(w, h)` with the source aspect ratio that fits the bounds
fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let scale = (max_w as f64 / width.max(1) as f64).min(max_h as f64 / height.max(1) as f64);
    let w = ((width as f64 * scale) as u32).clamp(1, max_w.max(1));
    let h = ((height as f64 * scale) as u32).clamp(1, max_h.max(1));
    (w, h)
}

/// Render an image into `cols` x `rows` cells, two pixel rows per cell:
/// the upper half block takes the top pixel as foreground and the bottom
/// pixel as background.
fn half_block_lines(image: &RgbImage, cols: u16, rows: u16) -> Vec<Line<'static>> {
    if cols == 0 || rows == 0 || image.width() == 0 || image.height() == 0 {
        return Vec::new();
    }
    let (w, h) = fit_within(image.width(), image.height(), cols as u32, rows as u32 * 2);
    let scaled = if (w, h) == image.dimensions() {
        image.clone()
    } else {
        imageops::resize(image, w, h, FilterType::Triangle)
    };

    let rgb = |p: &Rgb<u8>| Color::Rgb(p[0], p[1], p[2]);
    (0..h)
        .step_by(2)
        .map(|y| {
            let cells: Vec<Span<'static>> = (0..w)
                .map(|x| {
                    let top = scaled.get_pixel(x, y);
                    let bottom = if y + 1 < h { scaled.get_pixel(x, y + 1) } else { top };
                    Span::styled("▀", Style::default().fg(rgb(top)).bg(rgb(bottom)))
                })
                .collect();
            Line::from(cells)
        })
        .collect()
}

/// Full-screen ratatui renderer; restores the terminal on drop
pub struct TerminalRenderer {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
    state: ViewState,
}

impl TerminalRenderer {
    /// Switch the terminal to raw mode on the alternate screen
    pub fn enter(site_id: &str, cameras: &[CameraId]) -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        let mut state = ViewState { site_id: site_id.to_string(), ..Default::default() };
        for id in cameras {
            state.cameras.insert(*id, CameraView::default());
        }
        Ok(Self { terminal, state })
    }
}

impl Drop for TerminalRenderer {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

impl Renderer for TerminalRenderer {
    fn render_frame(&mut self, frame: &AnnotatedFrame) {
        self.state.record_frame(frame);
    }

    fn close_view(&mut self, camera_id: CameraId) {
        self.state.cameras.entry(camera_id).or_default().closed = true;
    }

    fn render_slots(&mut self, table: &SlotTable) {
        self.state.table = table.clone();
    }

    fn present(&mut self) {
        let state = &self.state;
        if let Err(e) = self.terminal.draw(|f| draw_ui(f, state)) {
            warn!(error = %e, "terminal_draw_failed");
        }
    }
}

fn draw_ui(f: &mut Frame, state: &ViewState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(6),    // Cameras
            Constraint::Length(state.table.slots.len() as u16 + 3), // Slots
            Constraint::Length(1), // Keys
        ])
        .split(f.area());

    draw_header(f, chunks[0], state);
    draw_cameras(f, chunks[1], state);
    draw_slots(f, chunks[2], state);

    let release_keys = if state.table.slots.len() > 9 { " digits+Enter " } else { " 1-9 " };
    let keys = Paragraph::new(Line::from(vec![
        Span::styled(" q ", Style::default().fg(Color::Black).bg(Color::Gray)),
        Span::raw(" stop cameras  "),
        Span::styled(release_keys, Style::default().fg(Color::Black).bg(Color::Gray)),
        Span::raw(" release slot"),
    ]));
    f.render_widget(keys, chunks[3]);
}

fn draw_header(f: &mut Frame, area: Rect, state: &ViewState) {
    let occupied = state.table.slots.iter().filter(|s| s.status() == SlotStatus::Occupied).count();
    let live = state.cameras.values().filter(|c| !c.closed).count();

    let header = Paragraph::new(Line::from(vec![
        Span::styled(" PARKGATE ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(format!(" site {} ", state.site_id)),
        Span::raw(format!(" cameras {}/{} ", live, state.cameras.len())),
        Span::styled(
            format!(" occupied {}/{} ", occupied, state.table.slots.len()),
            Style::default().fg(if occupied == state.table.slots.len() { Color::Red } else { Color::Green }),
        ),
        Span::styled(format!(" rev {}", state.table.revision), Style::default().fg(Color::DarkGray)),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn draw_cameras(f: &mut Frame, area: Rect, state: &ViewState) {
    if state.cameras.is_empty() {
        return;
    }
    let share = 100 / state.cameras.len() as u16;
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(vec![Constraint::Percentage(share); state.cameras.len()])
        .split(area);

    for ((id, view), column) in state.cameras.iter().zip(columns.iter()) {
        let mut items = vec![ListItem::new(Line::from(Span::styled(
            format!("frame {}  {}x{}", view.sequence, view.width, view.height),
            Style::default().fg(Color::DarkGray),
        )))];
        items.extend(view.labels.iter().map(|(text, registered)| {
            let (mark, color) = if *registered { ("✓", Color::Green) } else { ("·", Color::Yellow) };
            ListItem::new(Line::from(vec![
                Span::styled(mark, Style::default().fg(color)),
                Span::raw(format!(" {}", if text.is_empty() { "?" } else { text.as_str() })),
            ]))
        }));

        let (title, border) = if view.closed {
            (format!(" Camera {} (closed) ", id), Color::DarkGray)
        } else {
            (format!(" Camera {} ", id), Color::Blue)
        };
        let block =
            Block::default().title(title).borders(Borders::ALL).border_style(Style::default().fg(border));
        let inner = block.inner(*column);
        f.render_widget(block, *column);

        let parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(items.len() as u16), Constraint::Min(0)])
            .split(inner);
        f.render_widget(List::new(items), parts[0]);

        if let Some(thumbnail) = &view.thumbnail {
            let picture = half_block_lines(thumbnail, parts[1].width, parts[1].height);
            f.render_widget(Paragraph::new(picture), parts[1]);
        }
    }
}

fn draw_slots(f: &mut Frame, area: Rect, state: &ViewState) {
    let rows: Vec<Row> = state
        .table
        .slots
        .iter()
        .map(|slot| {
            let color = match slot.status() {
                SlotStatus::Empty => Color::Green,
                SlotStatus::Occupied => Color::Red,
            };
            Row::new(vec![
                Span::raw(slot.slot_number.to_string()),
                Span::styled(slot.status().as_str(), Style::default().fg(color)),
                Span::raw(slot.plate().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),  // Slot
            Constraint::Length(10), // Status
            Constraint::Min(10),    // Plate
        ],
    )
    .header(
        Row::new(vec!["Slot", "Status", "Plate"])
            .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
    )
    .block(
        Block::default()
            .title(" Parking Slots ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta)),
    );

    f.render_widget(table, area);
}

/// Keyboard input read without blocking
#[derive(Debug)]
pub struct KeyboardInput {
    max_slots: u32,
    /// Slot number being typed when releases need more than one digit
    pending: String,
}

impl KeyboardInput {
    pub fn new(max_slots: u32) -> Self {
        Self { max_slots, pending: String::new() }
    }

    fn key_command(&mut self, key: KeyEvent) -> Option<OperatorCommand> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        match key.code {
            KeyCode::Char('q') => Some(OperatorCommand::Stop),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(OperatorCommand::Stop)
            }
            KeyCode::Esc if !self.pending.is_empty() => {
                self.pending.clear();
                None
            }
            KeyCode::Esc => Some(OperatorCommand::Stop),
            KeyCode::Char(c @ '0'..='9') if self.max_slots <= 9 => {
                c.to_digit(10).filter(|d| *d > 0).map(|d| OperatorCommand::Release(SlotNumber(d)))
            }
            KeyCode::Char(c @ '0'..='9') => {
                if self.pending.len() < MAX_SLOT_DIGITS {
                    self.pending.push(c);
                }
                None
            }
            KeyCode::Backspace => {
                self.pending.pop();
                None
            }
            KeyCode::Enter => {
                let typed = std::mem::take(&mut self.pending);
                typed
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(|n| OperatorCommand::Release(SlotNumber(n)))
            }
            _ => None,
        }
    }
}

impl OperatorInput for KeyboardInput {
    fn poll(&mut self) -> Option<OperatorCommand> {
        // Drain pending events; the first command wins this tick
        loop {
            match event::poll(Duration::ZERO) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    warn!(error = %e, "terminal_input_poll_failed");
                    return None;
                }
            }
            match event::read() {
                Ok(Event::Key(key)) => {
                    if let Some(cmd) = self.key_command(key) {
                        return Some(cmd);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "terminal_input_read_failed");
                    return None;
                }
            }
        }
    }
}
