//! ratatui screen and keyboard input on top of `crossterm`.
//!
//! ┌ wtop ─────────────────────────────────────────┐
//! │ rate: fast  mode: normal  sort: cpu (desc)    │
//! │ status line                                   │
//! └───────────────────────────────────────────────┘
//! ┌ Resources ────────────────────────────────────┐
//! │ CPU  cores  Mem  Swp  Dsk  I/O + Net          │
//! └───────────────────────────────────────────────┘
//! ┌ Processes 1-20 of 143 ────────────────────────┐
//! │ PID  PPID  CPU%  THR  MEM  NAME               │
//! └───────────────────────────────────────────────┘
//!  key help

use std::{
    io::{self, Stdout},
    time::Duration,
};

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{self, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{prelude::*, widgets::*};
use wtop_core::{
    scheduler::PAGE_ROWS, Command, DerivedProcessInfo, InputSource, Mode, RefreshRate,
    RenderSnapshot, Renderer, Result, SortKey,
};

const CORES_PER_LINE: usize = 4;

/// CPU, Mem, Swp, Dsk and the I/O line.
const RESOURCE_LINES: usize = 5;

/// Owns the alternate screen until dropped.
pub struct TerminalRenderer {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalRenderer {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        let terminal = execute!(stdout, EnterAlternateScreen)
            .and_then(|()| Terminal::new(CrosstermBackend::new(stdout)));
        match terminal {
            Ok(terminal) => Ok(Self { terminal }),
            Err(err) => {
                let _ = execute!(io::stdout(), LeaveAlternateScreen);
                let _ = terminal::disable_raw_mode();
                Err(err.into())
            }
        }
    }
}

impl Drop for TerminalRenderer {
    fn drop(&mut self) {
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
        let _ = terminal::disable_raw_mode();
    }
}

impl Renderer for TerminalRenderer {
    fn render(&mut self, snapshot: &RenderSnapshot) -> Result<()> {
        self.terminal.draw(|f| draw(f, snapshot))?;
        Ok(())
    }
}

pub fn draw(f: &mut Frame, snapshot: &RenderSnapshot) {
    let core_rows = snapshot.cpu_per_core.len().div_ceil(CORES_PER_LINE);
    let resource_height = u16::try_from(RESOURCE_LINES + core_rows + 2).unwrap_or(u16::MAX);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),               // header
            Constraint::Length(resource_height), // gauges
            Constraint::Min(3),                  // processes
            Constraint::Length(1),               // keys
        ])
        .split(f.area());

    draw_header(f, rows[0], snapshot);
    draw_resources(f, rows[1], snapshot, core_rows);
    draw_processes(f, rows[2], snapshot);
    draw_keys(f, rows[3]);
}

fn draw_header(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot) {
    let mode = match snapshot.mode {
        Mode::Normal => "normal",
        Mode::HighSpeed => "high-speed",
        Mode::Party => "party",
    };
    let mut summary = vec![
        Span::raw(format!("rate: {}  ", snapshot.rate)),
        Span::styled(
            format!("mode: {mode}"),
            Style::default().bold().fg(if snapshot.mode == Mode::Party {
                Color::Magenta
            } else {
                Color::Cyan
            }),
        ),
        Span::raw(format!("  sort: {}", snapshot.view.describe_sort())),
    ];
    if !snapshot.view.filter.is_empty() {
        summary.push(Span::styled(
            format!("  filter: '{}'", snapshot.view.filter),
            Style::default().fg(Color::Yellow),
        ));
    }

    let status = Line::from(Span::styled(
        snapshot.status.clone().unwrap_or_default(),
        Style::default().fg(Color::Yellow),
    ));
    let header = Paragraph::new(vec![Line::from(summary), status]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan))
            .title(Span::styled(" wtop ", Style::default().bold())),
    );
    f.render_widget(header, area);
}

fn draw_resources(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot, core_rows: usize) {
    let block = Block::default().borders(Borders::ALL).title(" Resources ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let lines = Layout::vertical(vec![Constraint::Length(1); RESOURCE_LINES + core_rows]).split(inner);
    f.render_widget(gauge("CPU", snapshot.cpu_total), lines[0]);

    for (row, chunk) in snapshot.cpu_per_core.chunks(CORES_PER_LINE).enumerate() {
        let columns =
            Layout::horizontal([Constraint::Ratio(1, CORES_PER_LINE as u32); CORES_PER_LINE])
                .split(lines[1 + row]);
        for (column, value) in chunk.iter().enumerate() {
            let core = row * CORES_PER_LINE + column;
            f.render_widget(gauge(&format!("{core:>3}"), *value), columns[column]);
        }
    }

    let rest = 1 + core_rows;
    f.render_widget(gauge("Mem", snapshot.memory_percent), lines[rest]);
    f.render_widget(gauge("Swp", snapshot.swap_percent), lines[rest + 1]);
    f.render_widget(gauge("Dsk", snapshot.disk_percent), lines[rest + 2]);

    let io = Paragraph::new(Line::from(vec![
        Span::styled("I/O ", Style::default().bold()),
        Span::raw(format!(
            "read {}/s  write {}/s   ",
            format_bytes(snapshot.disk_read_bytes_per_sec),
            format_bytes(snapshot.disk_write_bytes_per_sec),
        )),
        Span::styled("Net ", Style::default().bold()),
        Span::raw(format!(
            "rx {}/s  tx {}/s",
            format_bytes(snapshot.net_rx_bytes_per_sec),
            format_bytes(snapshot.net_tx_bytes_per_sec),
        )),
    ]));
    f.render_widget(io, lines[rest + 3]);
}

/// One-line gauge labelled `NAME  42.0%`.
fn gauge(name: &str, percent: f32) -> LineGauge<'static> {
    let ratio = gauge_ratio(percent);
    LineGauge::default()
        .label(format!("{name} {:5.1}%", ratio * 100.0))
        .filled_style(Style::default().fg(level_color(ratio)))
        .unfilled_style(Style::default().fg(Color::DarkGray))
        .line_set(symbols::line::THICK)
        .ratio(ratio)
}

/// Percent as a 0..=1 ratio. Non-finite values read as empty.
pub fn gauge_ratio(percent: f32) -> f64 {
    if percent.is_finite() {
        f64::from(percent.clamp(0.0, 100.0)) / 100.0
    } else {
        0.0
    }
}

fn level_color(ratio: f64) -> Color {
    if ratio >= 0.9 {
        Color::Red
    } else if ratio >= 0.6 {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn draw_processes(f: &mut Frame, area: Rect, snapshot: &RenderSnapshot) {
    // Borders and the header row.
    let room = usize::from(area.height.saturating_sub(3));
    let first = snapshot.first_visible(room);
    let visible = snapshot.visible_processes(room);

    let header = Row::new(vec!["PID", "PPID", "CPU%", "THR", "MEM", "NAME"])
        .style(Style::default().bold().fg(Color::Cyan));
    let rows = visible.iter().map(|process| {
        Row::new(vec![
            format!("{:>7}", process.pid),
            format!("{:>7}", process.parent_pid),
            format!("{:>6.1}", process.cpu_percent),
            format!("{:>5}", process.thread_count),
            format!("{:>10}", format_bytes(process.working_set_bytes as f64)),
            process.name.clone(),
        ])
    });

    let title = if snapshot.processes.is_empty() {
        " Processes ".to_string()
    } else {
        format!(
            " Processes {}-{} of {} ",
            first + 1,
            first + visible.len(),
            snapshot.processes.len()
        )
    };
    let table = Table::new(
        rows,
        [
            Constraint::Length(7),  // pid
            Constraint::Length(7),  // ppid
            Constraint::Length(6),  // cpu
            Constraint::Length(5),  // threads
            Constraint::Length(10), // memory
            Constraint::Min(10),    // name
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

fn draw_keys(f: &mut Frame, area: Rect) {
    let bar = Paragraph::new(
        " q quit  p party  1-5 +/- rate  c/m/n/i sort  / filter  ↑↓ PgUp PgDn Home End scroll",
    )
    .style(Style::default().bg(Color::DarkGray).fg(Color::White));
    f.render_widget(bar, area);
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Plain-text table header for `wtop snapshot`.
pub fn process_header() -> String {
    format!(
        "{:>7} {:>7} {:>6} {:>5} {:>10}  {}",
        "PID", "PPID", "CPU%", "THR", "MEM", "NAME"
    )
}

pub fn process_row(process: &DerivedProcessInfo) -> String {
    format!(
        "{:>7} {:>7} {:>6.1} {:>5} {:>10}  {}",
        process.pid,
        process.parent_pid,
        process.cpu_percent,
        process.thread_count,
        format_bytes(process.working_set_bytes as f64),
        process.name
    )
}

/// Keyboard commands from the terminal event queue.
#[derive(Debug)]
pub struct KeyboardInput {
    /// Last rate requested from the keyboard, the base for `+` and `-`.
    rate: RefreshRate,
    /// Filter text being typed after `/`.
    editing: Option<String>,
}

impl KeyboardInput {
    pub fn new(rate: RefreshRate) -> Self {
        Self {
            rate,
            editing: None,
        }
    }

    /// Turns one key event into a command. While a filter is being typed
    /// every edit is applied at once; Enter keeps it and Esc clears it.
    pub fn translate(&mut self, key: KeyEvent) -> Option<Command> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Some(Command::Quit);
        }

        if let Some(filter) = self.editing.as_mut() {
            return match key.code {
                KeyCode::Enter => {
                    self.editing = None;
                    None
                }
                KeyCode::Esc => {
                    self.editing = None;
                    Some(Command::SetFilter(String::new()))
                }
                KeyCode::Backspace => {
                    filter.pop();
                    Some(Command::SetFilter(filter.clone()))
                }
                KeyCode::Char(c) => {
                    filter.push(c);
                    Some(Command::SetFilter(filter.clone()))
                }
                _ => None,
            };
        }

        if key.code == KeyCode::Char('/') {
            self.editing = Some(String::new());
            return None;
        }
        let command = map_key(key, self.rate);
        if let Some(Command::SetRefreshRate(rate)) = command {
            self.rate = rate;
        }
        command
    }

    pub fn is_editing(&self) -> bool {
        self.editing.is_some()
    }
}

impl InputSource for KeyboardInput {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Command>> {
        if !event::poll(timeout)? {
            return Ok(None);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(None);
        };
        Ok(self.translate(key))
    }
}

/// Key binding table outside filter editing.
pub fn map_key(key: KeyEvent, current: RefreshRate) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Command::Quit),
        KeyCode::Char('q') | KeyCode::Esc => Some(Command::Quit),
        KeyCode::Char('p') => Some(Command::ToggleParty),
        KeyCode::Char(digit @ '1'..='5') => {
            let index = digit as usize - '1' as usize;
            Some(Command::SetRefreshRate(RefreshRate::PRESETS[index]))
        }
        KeyCode::Char('+') | KeyCode::Char('=') => Some(Command::SetRefreshRate(current.faster())),
        KeyCode::Char('-') => Some(Command::SetRefreshRate(current.slower())),
        KeyCode::Char('c') => Some(Command::SortBy(SortKey::Cpu)),
        KeyCode::Char('m') => Some(Command::SortBy(SortKey::Memory)),
        KeyCode::Char('n') => Some(Command::SortBy(SortKey::Name)),
        KeyCode::Char('i') => Some(Command::SortBy(SortKey::Pid)),
        KeyCode::Up => Some(Command::ScrollBy(-1)),
        KeyCode::Down => Some(Command::ScrollBy(1)),
        KeyCode::PageUp => Some(Command::ScrollBy(-PAGE_ROWS)),
        KeyCode::PageDown => Some(Command::ScrollBy(PAGE_ROWS)),
        KeyCode::Home => Some(Command::ScrollTop),
        KeyCode::End => Some(Command::ScrollBottom),
        _ => None,
    }
}
