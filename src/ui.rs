use anyhow::Result;
use contractor_ledger::{
    format_currency, format_percent, sort_items, CollectingNotifier, ColumnDescriptor,
    ColumnField, ColumnType, DraftEdit, LineItem, Notification, ParseError, Phase,
    ReconciliationStatus, ReconciliationTable, Severity, SortDirection,
};
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::runtime::Runtime;

pub struct App {
    pub table: Arc<ReconciliationTable>,
    pub runtime: Runtime,
    pub notifier: CollectingNotifier,
    pub rows: Vec<LineItem>,
    pub state: TableState,
    /// Input buffer while the cost cell is being edited
    pub editing: Option<String>,
    /// Index into the sortable columns, plus direction
    pub sort: Option<(usize, SortDirection)>,
    pub last_notification: Option<Notification>,
    /// Drafts left out of the rows because they do not parse
    pub rejected: Vec<ParseError>,
}

impl App {
    pub fn new(
        table: Arc<ReconciliationTable>,
        runtime: Runtime,
        notifier: CollectingNotifier,
    ) -> Self {
        let mut app = Self {
            table,
            runtime,
            notifier,
            rows: Vec::new(),
            state: TableState::default(),
            editing: None,
            sort: None,
            last_notification: None,
            rejected: Vec::new(),
        };
        app.rebuild_rows();
        if !app.rows.is_empty() {
            app.state.select(Some(0));
        }
        app
    }

    /// Rows as loaded with drafts applied where they parse
    pub fn rebuild_rows(&mut self) {
        let (mut rows, rejected) = match self.table.preview_valid() {
            Ok((preview, rejected)) => (preview.merge.items, rejected),
            Err(_) => (Vec::new(), Vec::new()),
        };
        self.rejected = rejected;

        if let Some((index, direction)) = self.sort {
            if let Some(column) = self.sortable_columns().get(index) {
                sort_items(&mut rows, column.field.sort_field(), direction);
            }
        }

        self.rows = rows;
        if let Some(selected) = self.state.selected() {
            if selected >= self.rows.len() {
                self.state
                    .select(if self.rows.is_empty() { None } else { Some(self.rows.len() - 1) });
            }
        }
    }

    fn sortable_columns(&self) -> Vec<ColumnDescriptor> {
        self.table
            .columns()
            .iter()
            .filter(|c| c.sortable)
            .cloned()
            .collect()
    }

    fn pull_notifications(&mut self) {
        if let Some(last) = self.notifier.drain().pop() {
            self.last_notification = Some(last);
        }
    }

    pub fn selected_row(&self) -> Option<&LineItem> {
        self.state.selected().and_then(|i| self.rows.get(i))
    }

    pub fn start_edit(&mut self) {
        if !self.table.config().is_editable() {
            return;
        }
        let Some(row) = self.selected_row() else {
            return;
        };

        let current = self
            .table
            .drafts()
            .into_iter()
            .find(|d| d.id == row.id)
            .map(|d| d.cost)
            .unwrap_or_else(|| format!("{:.2}", row.cost));
        self.editing = Some(current);
    }

    pub fn commit_edit(&mut self) {
        let Some(input) = self.editing.take() else {
            return;
        };
        if let Some(id) = self.selected_row().map(|r| r.id.clone()) {
            self.table.stage_drafts(vec![DraftEdit { id, cost: input }]);
        }
        self.rebuild_rows();
    }

    pub fn save(&mut self) {
        if !self.table.can_save() {
            return;
        }
        let table = self.table.clone();
        let _ = self.runtime.block_on(table.save());
        self.pull_notifications();
        self.rebuild_rows();
    }

    pub fn refresh(&mut self) {
        let table = self.table.clone();
        let _ = self.runtime.block_on(table.refresh());
        self.pull_notifications();
        self.rebuild_rows();
    }

    pub fn discard_drafts(&mut self) {
        self.table.discard_drafts();
        self.rebuild_rows();
    }

    pub fn cycle_sort(&mut self) {
        let count = self.sortable_columns().len();
        if count == 0 {
            return;
        }
        self.sort = match self.sort {
            None => Some((0, SortDirection::Asc)),
            Some((i, _)) if i + 1 >= count => None,
            Some((i, direction)) => Some((i + 1, direction)),
        };
        self.rebuild_rows();
    }

    pub fn toggle_sort_direction(&mut self) {
        if let Some((i, direction)) = self.sort {
            self.sort = Some((i, direction.toggle()));
            self.rebuild_rows();
        }
    }

    pub fn next(&mut self) {
        let len = self.rows.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) => {
                if i >= len - 1 {
                    0
                } else {
                    i + 1
                }
            }
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let len = self.rows.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) => {
                if i == 0 {
                    len - 1
                } else {
                    i - 1
                }
            }
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn page_down(&mut self) {
        let len = self.rows.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) => (i + 20).min(len - 1),
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn page_up(&mut self) {
        let i = match self.state.selected() {
            Some(i) => i.saturating_sub(20),
            None => 0,
        };
        self.state.select(Some(i));
    }
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        let Event::Key(key) = event::read()? else {
            continue;
        };

        if app.editing.is_some() {
            match key.code {
                KeyCode::Enter => app.commit_edit(),
                KeyCode::Esc => app.editing = None,
                KeyCode::Backspace => {
                    if let Some(buffer) = app.editing.as_mut() {
                        buffer.pop();
                    }
                }
                KeyCode::Char(c) if c.is_ascii_digit() || matches!(c, '.' | '-' | ',' | '$') => {
                    if let Some(buffer) = app.editing.as_mut() {
                        buffer.push(c);
                    }
                }
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Enter => app.start_edit(),
            KeyCode::Char('s') => app.save(),
            KeyCode::Char('r') => app.refresh(),
            KeyCode::Char('u') => app.discard_drafts(),
            KeyCode::Tab => app.cycle_sort(),
            KeyCode::Char('d') => app.toggle_sort_direction(),
            KeyCode::Down | KeyCode::Char('j') => app.next(),
            KeyCode::Up | KeyCode::Char('k') => app.previous(),
            KeyCode::PageDown => app.page_down(),
            KeyCode::PageUp => app.page_up(),
            KeyCode::Home => app.state.select(Some(0)),
            KeyCode::End => {
                if !app.rows.is_empty() {
                    app.state.select(Some(app.rows.len() - 1));
                }
            }
            _ => {}
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Line items
            Constraint::Length(3), // Totals
            Constraint::Length(3), // Notification + keys
        ])
        .split(f.size());

    render_header(f, chunks[0], app);
    render_table(f, chunks[1], app);
    render_totals(f, chunks[2], app);
    render_status_bar(f, chunks[3], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let parent = app.table.loader().parent_id().unwrap_or_default();
    let (phase, phase_color) = match app.table.phase() {
        Phase::Idle => ("Idle", Color::DarkGray),
        Phase::Loading => ("Loading…", Color::Cyan),
        Phase::Saving => ("Saving…", Color::Yellow),
    };

    let mut spans = vec![
        Span::styled(
            app.table.config().title.clone(),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  |  "),
        Span::styled(parent, Style::default().fg(Color::White)),
        Span::raw("  |  "),
        Span::styled(phase, Style::default().fg(phase_color)),
    ];

    let pending = app.table.drafts().len();
    if pending > 0 {
        spans.push(Span::raw("  |  "));
        spans.push(Span::styled(
            format!("✎ {} pending", pending),
            Style::default().fg(Color::Yellow),
        ));
    }

    if let Some(err) = app.table.load_state().error() {
        spans.push(Span::raw("  |  "));
        spans.push(Span::styled(
            format!("Error: {}", err.user_message()),
            Style::default().fg(Color::Red),
        ));
    }

    let header = Paragraph::new(vec![Line::from(spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );

    f.render_widget(header, area);
}

fn cell_text(item: &LineItem, column: &ColumnDescriptor) -> String {
    match column.field {
        ColumnField::DisplayName => truncate(&item.display_name, 30),
        ColumnField::ContactName => truncate(item.contact_name.as_deref().unwrap_or(""), 24),
        ColumnField::Category => truncate(&item.category, 20),
        ColumnField::Cost => match column.column_type {
            ColumnType::Currency => format_currency(item.cost),
            _ => format!("{:.*}", column.fraction_digits, item.cost),
        },
        ColumnField::BudgetPercentage => {
            format_percent(item.budget_percentage, column.fraction_digits)
        }
        ColumnField::LastBilledDate => item
            .last_billed_date
            .map(|d| d.format("%B %-d, %Y").to_string())
            .unwrap_or_default(),
    }
}

fn render_table(f: &mut Frame, area: Rect, app: &mut App) {
    let columns = app.table.columns().to_vec();
    let sorted_field = app
        .sort
        .and_then(|(i, dir)| app.sortable_columns().get(i).map(|c| (c.field, dir)));

    let header_cells = columns.iter().map(|c| {
        let marker = match sorted_field {
            Some((field, SortDirection::Asc)) if field == c.field => " ▲",
            Some((field, SortDirection::Desc)) if field == c.field => " ▼",
            _ => "",
        };
        Cell::from(format!("{}{}", c.label, marker)).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    });

    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let drafts = app.table.drafts();
    let selected = app.state.selected();
    let editing = app.editing.clone();
    let rejected = &app.rejected;

    let rows = app.rows.iter().enumerate().map(|(index, item)| {
        let draft = drafts.iter().find(|d| d.id == item.id);

        let cells: Vec<Cell> = columns
            .iter()
            .map(|column| {
                if column.field == ColumnField::Cost && column.editable {
                    if let (Some(buffer), true) = (&editing, selected == Some(index)) {
                        return Cell::from(format!("{}▏", buffer))
                            .style(Style::default().fg(Color::Black).bg(Color::Yellow));
                    }
                    if let Some(draft) = draft {
                        let color = if rejected.iter().any(|r| r.row_id == item.id) {
                            Color::Red
                        } else {
                            Color::Yellow
                        };
                        return Cell::from(draft.cost.clone()).style(Style::default().fg(color));
                    }
                }
                Cell::from(cell_text(item, column))
            })
            .collect();

        Row::new(cells).height(1)
    });

    let widths: Vec<Constraint> = columns
        .iter()
        .map(|c| match c.column_type {
            ColumnType::Text => Constraint::Length(32),
            ColumnType::Currency => Constraint::Length(16),
            ColumnType::Percent => Constraint::Length(12),
            ColumnType::Date => Constraint::Length(20),
        })
        .collect();

    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(format!(" {} ", app.table.config().title)),
        )
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.state);
}

fn render_totals(f: &mut Frame, area: Rect, app: &App) {
    let spans = match app.table.preview_valid() {
        Ok((preview, rejected)) => {
            let mut spans = totals_spans(&preview.status);
            // Totals above leave these drafts out
            if let Some(first) = rejected.first() {
                spans.push(Span::raw("  |  "));
                let text = match rejected.len() {
                    1 => first.to_string(),
                    n => format!("{} (+{} more)", first, n - 1),
                };
                spans.push(Span::styled(text, Style::default().fg(Color::Red)));
            }
            spans
        }
        Err(_) => vec![Span::styled(
            "No line items loaded",
            Style::default().fg(Color::DarkGray),
        )],
    };

    let totals = Paragraph::new(vec![Line::from(spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(totals, area);
}

fn totals_spans(status: &ReconciliationStatus) -> Vec<Span<'static>> {
    let (label, color) = if status.is_balanced {
        ("✓ Balanced", Color::Green)
    } else {
        ("✗ Unbalanced", Color::Red)
    };

    vec![
        Span::styled(
            format!(" Total: {}", format_currency(status.total_cost)),
            Style::default().fg(Color::White),
        ),
        Span::raw("  |  "),
        Span::styled(
            format!("Reference: {}", format_currency(status.reference_total)),
            Style::default().fg(Color::Cyan),
        ),
        Span::raw("  |  "),
        Span::styled(
            format!("Difference: {}", format_currency(status.remaining())),
            Style::default().fg(color),
        ),
        Span::raw("  "),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ]
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let selected = app.state.selected().map(|i| i + 1).unwrap_or(0);
    let total = app.rows.len();

    let mut status_spans = vec![Span::styled(
        format!(" Row: {}/{} ", selected, total),
        Style::default().fg(Color::Cyan),
    )];

    if let Some(note) = &app.last_notification {
        let color = match note.severity {
            Severity::Success => Color::Green,
            Severity::Error => Color::Red,
        };
        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled(
            format!("{}: {}", note.title, note.message),
            Style::default().fg(color),
        ));
    }

    let keys: &[(&str, &str)] = if app.editing.is_some() {
        &[("Enter", " Stage"), ("Esc", " Cancel")]
    } else if app.table.config().is_editable() {
        &[
            ("Enter", " Edit"),
            ("s", " Save"),
            ("u", " Undo"),
            ("r", " Refresh"),
            ("Tab", " Sort"),
            ("q", " Quit"),
        ]
    } else {
        &[("r", " Refresh"), ("Tab", " Sort"), ("d", " Dir"), ("q", " Quit")]
    };

    for (key, label) in keys {
        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled(*key, Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(*label));
    }

    let status_bar = Paragraph::new(vec![Line::from(status_spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
