use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Clear, Paragraph};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::command::{
    Command, ConnectionStatus, LoadView, OrderInfo, OrderRequest, OrderSide, OrderSnapshot,
    OrdersView, TradeEvent, TradeFill, TradingCommand,
};
use crate::csv_io::{export_market_csv, import_pairs_csv};
use crate::journal::{ErrorJournal, JournalEntry, OrderJournal};
use crate::tables::{
    BalanceColumn, BalanceTable, MarketColumn, MarketTable, Trend, format_price, format_time_ms,
    format_two,
};
use crate::workers::PairController;

const MAX_LOG_ROWS: usize = 200;
const ORDER_RELOAD_DELAY: Duration = Duration::from_millis(400);
const MARKET_WIDTHS: [usize; 5] = [19, 14, 8, 14, 14];
const MARKET_ALIGNS: [ColumnAlign; 5] = [
    ColumnAlign::Left,
    ColumnAlign::Left,
    ColumnAlign::Right,
    ColumnAlign::Right,
    ColumnAlign::Right,
];
const BALANCE_WIDTHS: [usize; 4] = [16, 14, 14, 14];
const BALANCE_ALIGNS: [ColumnAlign; 4] = [
    ColumnAlign::Left,
    ColumnAlign::Right,
    ColumnAlign::Right,
    ColumnAlign::Right,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Focus {
    Market,
    Balances,
    Orders,
}

impl Focus {
    fn next(self) -> Focus {
        match self {
            Focus::Market => Focus::Balances,
            Focus::Balances => Focus::Orders,
            Focus::Orders => Focus::Market,
        }
    }

    fn prev(self) -> Focus {
        match self {
            Focus::Market => Focus::Orders,
            Focus::Balances => Focus::Market,
            Focus::Orders => Focus::Balances,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OrderInputField {
    Price,
    Amount,
}

#[derive(Clone, Debug)]
struct OrderInputState {
    side: OrderSide,
    pair: String,
    price: String,
    amount: String,
    active_field: OrderInputField,
    error: Option<String>,
}

impl OrderInputState {
    fn active_value_mut(&mut self) -> &mut String {
        match self.active_field {
            OrderInputField::Price => &mut self.price,
            OrderInputField::Amount => &mut self.amount,
        }
    }

    fn focus_next_field(&mut self) {
        self.active_field = match self.active_field {
            OrderInputField::Price => OrderInputField::Amount,
            OrderInputField::Amount => OrderInputField::Price,
        };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PromptKind {
    AddPair,
    ImportPath,
}

impl PromptKind {
    fn title(self) -> &'static str {
        match self {
            PromptKind::AddPair => "Add pair",
            PromptKind::ImportPath => "Import pairs from CSV",
        }
    }

    fn accepts(self, c: char) -> bool {
        match self {
            PromptKind::AddPair => c.is_ascii_alphanumeric() || c == '_',
            PromptKind::ImportPath => !c.is_control(),
        }
    }
}

#[derive(Clone, Debug)]
struct PromptState {
    kind: PromptKind,
    value: String,
}

/// Channels and stores the dashboard talks to.
pub struct DashboardLinks {
    pub pairs: PairController,
    pub orders: mpsc::Sender<TradingCommand>,
    pub bus: broadcast::Sender<Command>,
    pub order_log: OrderJournal,
    pub error_log: ErrorJournal,
    pub export_path: PathBuf,
}

pub struct TuiApp {
    links: DashboardLinks,
    market: MarketTable,
    balances: BalanceTable,
    marked: BTreeSet<String>,
    focus: Focus,
    selected_market: usize,
    selected_balance: usize,
    selected_order: usize,
    orders_view: OrdersView,
    orders_pair: Option<String>,
    open_orders: Vec<OrderInfo>,
    finished_orders: Vec<OrderInfo>,
    trades: Vec<TradeFill>,
    order_log: Vec<JournalEntry<TradeEvent>>,
    reload_orders_at: Option<Instant>,
    input: Option<OrderInputState>,
    prompt: Option<PromptState>,
    connection: String,
    status_message: Option<String>,
    status_visible_until: Option<Instant>,
    status_is_error: bool,
    exit_confirmation: bool,
    last_draw: Instant,
    min_redraw_gap: Duration,
}

impl TuiApp {
    pub fn new(links: DashboardLinks, pairs: &[String], min_balance: f64) -> TuiApp {
        let min_redraw_gap = Duration::from_millis(100);
        let mut market = MarketTable::new();
        for pair in pairs {
            market.track(pair);
        }
        TuiApp {
            links,
            market,
            balances: BalanceTable::new(min_balance),
            marked: BTreeSet::new(),
            focus: Focus::Market,
            selected_market: 0,
            selected_balance: 0,
            selected_order: 0,
            orders_view: OrdersView::Open,
            orders_pair: None,
            open_orders: Vec::new(),
            finished_orders: Vec::new(),
            trades: Vec::new(),
            order_log: Vec::new(),
            reload_orders_at: Some(Instant::now()),
            input: None,
            prompt: None,
            connection: ConnectionStatus::Connecting { attempt: 1 }.label(),
            status_message: None,
            status_visible_until: None,
            status_is_error: false,
            exit_confirmation: false,
            last_draw: Instant::now() - min_redraw_gap,
            min_redraw_gap,
        }
    }

    fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(3));
        self.status_is_error = false;
    }

    fn set_error_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(5));
        self.status_is_error = true;
    }

    fn clear_status_if_allowed(&mut self) {
        if let Some(visible_until) = self.status_visible_until {
            if Instant::now() < visible_until {
                return;
            }
        }
        self.status_message = None;
        self.status_visible_until = None;
        self.status_is_error = false;
    }

    pub fn dispose(&self) {
        ratatui::restore();
    }

    pub fn preload_order_log(&mut self) {
        match self.links.order_log.recent(MAX_LOG_ROWS, |_| true) {
            Ok(entries) => self.order_log = entries,
            Err(err) => self.set_error_status_message(format!("loading order log failed: {err}")),
        }
    }

    pub async fn run(
        &mut self,
        rx: &mut broadcast::Receiver<Command>,
        exit_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        color_eyre::install()?;
        let mut terminal = ratatui::init();
        let mut input_tick = tokio::time::interval(self.min_redraw_gap);
        terminal.draw(|frame| self.render(frame))?;
        self.last_draw = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = input_tick.tick() => {
                    if self.poll_input()? {
                        return Ok(());
                    }
                    self.reload_orders_if_due();
                    self.clear_status_if_allowed();
                    terminal.draw(|frame| self.render(frame))?;
                    self.last_draw = Instant::now();
                }
                result = rx.recv() => {
                    match result {
                        Ok(command) => {
                            let urgent = self.apply_command(command);
                            if urgent || self.last_draw.elapsed() >= self.min_redraw_gap {
                                terminal.draw(|frame| self.render(frame))?;
                                self.last_draw = Instant::now();
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
                signal = exit_rx.recv() => match signal {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        Ok(())
    }

    /// Folds one bus message into the view. Returns whether it should be drawn
    /// right away instead of waiting for the next frame.
    fn apply_command(&mut self, command: Command) -> bool {
        match command {
            Command::Ticker(update) => {
                self.market.upsert(&update);
                false
            }
            Command::PairTracked(pair) => {
                self.market.track(&pair);
                true
            }
            Command::PairUntracked(pair) => {
                self.market.remove(&pair);
                self.marked.remove(&pair);
                self.selected_market = clamp_index(self.selected_market, self.market.len());
                self.schedule_order_reload();
                true
            }
            Command::Connection(status) => {
                self.connection = status.label();
                if let ConnectionStatus::GaveUp { attempts } = status {
                    self.set_error_status_message(format!(
                        "market stream stopped after {attempts} failed attempts"
                    ));
                }
                true
            }
            Command::Balances(snapshot) => {
                self.balances.replace(snapshot);
                self.selected_balance = clamp_index(self.selected_balance, self.balances.len());
                true
            }
            Command::Orders(snapshot) => {
                self.apply_orders(snapshot);
                true
            }
            Command::TradeResult(event) => {
                if event.success() {
                    self.set_status_message(event.message().to_string());
                } else {
                    self.set_error_status_message(event.message().to_string());
                }
                self.order_log.insert(0, JournalEntry::now(event));
                self.order_log.truncate(MAX_LOG_ROWS);
                true
            }
            Command::Notify(message) => {
                self.set_status_message(message);
                true
            }
            Command::Error(message) => {
                if let Err(err) = self.links.error_log.note(message.clone()) {
                    tracing::warn!("error log write failed: {err:#}");
                }
                self.set_error_status_message(message);
                true
            }
            Command::Candle(_) | Command::BalancesChanged => false,
        }
    }

    fn apply_orders(&mut self, snapshot: OrderSnapshot) {
        if self.selected_pair().as_deref() != Some(snapshot.pair()) {
            return;
        }
        self.orders_pair = Some(snapshot.pair().to_string());
        match snapshot {
            OrderSnapshot::Open { orders, .. } => self.open_orders = orders,
            OrderSnapshot::Finished { orders, .. } => self.finished_orders = orders,
            OrderSnapshot::Trades { trades, .. } => self.trades = trades,
        }
        self.selected_order = clamp_index(self.selected_order, self.orders_len());
    }

    fn selected_pair(&self) -> Option<String> {
        self.market
            .rows()
            .get(clamp_index(self.selected_market, self.market.len()))
            .map(|row| row.pair.clone())
    }

    fn log_for_selected(&self) -> Vec<&JournalEntry<TradeEvent>> {
        let pair = self.selected_pair();
        self.order_log
            .iter()
            .filter(|entry| pair.as_deref() == Some(entry.record.currency_pair()))
            .collect()
    }

    fn orders_len(&self) -> usize {
        match self.orders_view {
            OrdersView::Open => self.open_orders.len(),
            OrdersView::Finished => self.finished_orders.len(),
            OrdersView::Trades => self.trades.len(),
            OrdersView::Log => self.log_for_selected().len(),
        }
    }

    fn schedule_order_reload(&mut self) {
        self.reload_orders_at = Some(Instant::now() + ORDER_RELOAD_DELAY);
    }

    fn reload_orders_if_due(&mut self) {
        match self.reload_orders_at {
            Some(at) if Instant::now() >= at => {
                self.reload_orders_at = None;
                self.request_orders();
            }
            _ => {}
        }
    }

    fn request_orders(&mut self) {
        let Some(pair) = self.selected_pair() else {
            return;
        };
        if self.orders_pair.as_deref() != Some(pair.as_str()) {
            self.open_orders.clear();
            self.finished_orders.clear();
            self.trades.clear();
            self.selected_order = 0;
        }
        let view = match self.orders_view {
            OrdersView::Open => LoadView::Open,
            OrdersView::Finished => LoadView::Finished,
            OrdersView::Trades => LoadView::Trades,
            OrdersView::Log => return,
        };
        let request = TradingCommand::Load {
            currency_pair: pair,
            view,
        };
        // A full queue means a load is already pending.
        if let Err(TrySendError::Closed(_)) = self.links.orders.try_send(request) {
            self.set_error_status_message("order channel is closed");
        }
    }

    fn poll_input(&mut self) -> Result<bool> {
        while event::poll(Duration::from_millis(0))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if self.handle_key_event(key) {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// Returns `true` when the dashboard should close.
    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        if self.exit_confirmation {
            return self.handle_exit_confirmation_key(key);
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.prompt_exit_confirmation();
            return false;
        }
        if self.input.is_some() {
            self.handle_order_input_key(key);
            return false;
        }
        if self.prompt.is_some() {
            self.handle_prompt_key(key);
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.prompt_exit_confirmation(),
            KeyCode::Tab => self.focus = self.focus.next(),
            KeyCode::BackTab => self.focus = self.focus.prev(),
            KeyCode::Up => self.move_selection(-1),
            KeyCode::Down => self.move_selection(1),
            KeyCode::PageUp => self.move_selection(-10),
            KeyCode::PageDown => self.move_selection(10),
            KeyCode::Char(' ') => self.toggle_mark(),
            KeyCode::Char('a') => {
                self.prompt = Some(PromptState {
                    kind: PromptKind::AddPair,
                    value: String::new(),
                });
            }
            KeyCode::Char('d') | KeyCode::Delete => self.remove_pairs(),
            KeyCode::Char('s') => self.cycle_sort_column(),
            KeyCode::Char('r') => self.toggle_sort_order(),
            KeyCode::Char('e') => self.export_csv(),
            KeyCode::Char('i') => {
                self.prompt = Some(PromptState {
                    kind: PromptKind::ImportPath,
                    value: self.links.export_path.display().to_string(),
                });
            }
            KeyCode::Char('b') => self.start_order_entry(OrderSide::Buy),
            KeyCode::Char('S') => self.start_order_entry(OrderSide::Sell),
            KeyCode::Char('c') => self.cancel_selected_order(),
            KeyCode::Char('h') => {
                self.orders_view = self.orders_view.next();
                self.selected_order = 0;
                self.request_orders();
            }
            KeyCode::Char('R') => {
                let _ = self.links.bus.send(Command::BalancesChanged);
                self.request_orders();
                self.set_status_message("refreshing balances and orders");
            }
            _ => {}
        }
        false
    }

    fn prompt_exit_confirmation(&mut self) {
        if self.exit_confirmation {
            return;
        }
        self.exit_confirmation = true;
        self.set_status_message("Quit? Y/Enter confirm, N/Esc cancel");
    }

    fn handle_exit_confirmation_key(&mut self, key: KeyEvent) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.exit_confirmation = false;
            return true;
        }
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Char('q') | KeyCode::Enter => {
                self.exit_confirmation = false;
                true
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.exit_confirmation = false;
                self.set_status_message("quit cancelled");
                false
            }
            _ => false,
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let (selected, len) = match self.focus {
            Focus::Market => (&mut self.selected_market, self.market.len()),
            Focus::Balances => (&mut self.selected_balance, self.balances.len()),
            Focus::Orders => {
                let len = self.orders_len();
                (&mut self.selected_order, len)
            }
        };
        if len == 0 {
            *selected = 0;
            return;
        }
        let current = clamp_index(*selected, len) as isize;
        let next = (current + delta).clamp(0, len as isize - 1) as usize;
        let changed = next != *selected;
        *selected = next;
        if changed && self.focus == Focus::Market {
            self.selected_order = 0;
            self.schedule_order_reload();
        }
    }

    fn toggle_mark(&mut self) {
        if self.focus != Focus::Market {
            return;
        }
        if let Some(pair) = self.selected_pair() {
            if !self.marked.remove(&pair) {
                self.marked.insert(pair);
            }
        }
    }

    fn remove_pairs(&mut self) {
        let targets: Vec<String> = if self.marked.is_empty() {
            self.selected_pair().into_iter().collect()
        } else {
            std::mem::take(&mut self.marked).into_iter().collect()
        };
        if targets.is_empty() {
            self.set_error_status_message("no pair selected");
            return;
        }
        self.set_status_message(format!("removing {}", targets.join(", ")));
        let controller = self.links.pairs.clone();
        tokio::spawn(async move {
            for pair in targets {
                controller.remove_reporting(pair).await;
            }
        });
    }

    fn cycle_sort_column(&mut self) {
        match self.focus {
            Focus::Balances => {
                self.balances.cycle_sort_column();
                let sort = self.balances.sort_state();
                self.set_status_message(format!("balances sorted by {}", sort.column.header()));
            }
            _ => {
                self.market.cycle_sort_column();
                let sort = self.market.sort_state();
                self.set_status_message(format!("market sorted by {}", sort.column.header()));
            }
        }
    }

    fn toggle_sort_order(&mut self) {
        match self.focus {
            Focus::Balances => self.balances.toggle_sort_order(),
            _ => self.market.toggle_sort_order(),
        }
    }

    fn export_csv(&mut self) {
        let path = self.links.export_path.clone();
        match export_market_csv(&self.market, &path) {
            Ok(rows) => self.set_status_message(format!("exported {rows} rows to {}", path.display())),
            Err(err) => self.set_error_status_message(format!("export failed: {err:#}")),
        }
    }

    fn import_csv(&mut self, path: &Path) {
        match import_pairs_csv(path) {
            Ok(pairs) if pairs.is_empty() => {
                self.set_error_status_message(format!("no pairs found in {}", path.display()));
            }
            Ok(pairs) => {
                self.set_status_message(format!("importing {} pairs", pairs.len()));
                let controller = self.links.pairs.clone();
                tokio::spawn(async move { controller.add_all_reporting(pairs).await });
            }
            Err(err) => self.set_error_status_message(format!("import failed: {err:#}")),
        }
    }

    fn handle_prompt_key(&mut self, key: KeyEvent) {
        let Some(prompt) = self.prompt.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Esc => self.prompt = None,
            KeyCode::Backspace => {
                prompt.value.pop();
            }
            KeyCode::Char(c) if prompt.kind.accepts(c) => prompt.value.push(c),
            KeyCode::Enter => {
                let Some(prompt) = self.prompt.take() else {
                    return;
                };
                let value = prompt.value.trim().to_string();
                if value.is_empty() {
                    return;
                }
                match prompt.kind {
                    PromptKind::AddPair => {
                        self.set_status_message(format!("validating {}", value.to_uppercase()));
                        let controller = self.links.pairs.clone();
                        tokio::spawn(async move { controller.add_reporting(value).await });
                    }
                    PromptKind::ImportPath => self.import_csv(Path::new(&value)),
                }
            }
            _ => {}
        }
    }

    fn start_order_entry(&mut self, side: OrderSide) {
        let Some(pair) = self.selected_pair() else {
            self.set_error_status_message("no pair selected");
            return;
        };
        let price = self
            .market
            .get(&pair)
            .filter(|row| row.has_data())
            .map(|row| format_price(row.last))
            .unwrap_or_default();
        self.input = Some(OrderInputState {
            side,
            pair,
            price,
            amount: String::new(),
            active_field: OrderInputField::Amount,
            error: None,
        });
    }

    fn handle_order_input_key(&mut self, key: KeyEvent) {
        let Some(input) = self.input.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Esc => {
                self.input = None;
                self.set_status_message("order cancelled");
            }
            KeyCode::Enter => self.finalize_order_input(),
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
                input.focus_next_field();
            }
            KeyCode::Backspace => {
                input.active_value_mut().pop();
            }
            KeyCode::Char(c) if c.is_ascii_digit() || c == '.' => {
                let field = input.active_value_mut();
                if c == '.' && field.contains('.') {
                    return;
                }
                field.push(c);
            }
            _ => {}
        }
    }

    fn finalize_order_input(&mut self) {
        let Some(input) = self.input.as_mut() else {
            return;
        };
        let price = match input.price.trim().parse::<f64>() {
            Ok(value) if value > 0.0 => value,
            _ => {
                input.error = Some("price must be a positive number".to_string());
                input.active_field = OrderInputField::Price;
                return;
            }
        };
        let amount = match input.amount.trim().parse::<f64>() {
            Ok(value) if value > 0.0 => value,
            _ => {
                input.error = Some("amount must be a positive number".to_string());
                input.active_field = OrderInputField::Amount;
                return;
            }
        };
        let request = OrderRequest {
            currency_pair: input.pair.clone(),
            side: input.side,
            price,
            amount,
        };
        let summary = format!(
            "{} {} {} @ {}",
            request.side.as_gate_side(),
            amount,
            request.currency_pair,
            price
        );
        match self.links.orders.try_send(TradingCommand::Place(request)) {
            Ok(_) => {
                self.input = None;
                self.set_status_message(format!("submitted {summary}"));
            }
            Err(TrySendError::Closed(_)) => {
                self.input = None;
                self.set_error_status_message("order channel is closed");
            }
            Err(TrySendError::Full(_)) => {
                if let Some(input) = self.input.as_mut() {
                    input.error = Some("too many pending requests, try again".to_string());
                }
            }
        }
    }

    fn cancel_selected_order(&mut self) {
        if self.orders_view != OrdersView::Open {
            self.set_error_status_message("switch to open orders (h) to cancel");
            return;
        }
        let Some(order) = self
            .open_orders
            .get(clamp_index(self.selected_order, self.open_orders.len()))
            .cloned()
        else {
            self.set_error_status_message("no open order selected");
            return;
        };
        let request = TradingCommand::Cancel {
            currency_pair: order.currency_pair.clone(),
            order_id: order.id.clone(),
        };
        match self.links.orders.try_send(request) {
            Ok(_) => self.set_status_message(format!("cancelling order {}", order.id)),
            Err(TrySendError::Closed(_)) => self.set_error_status_message("order channel is closed"),
            Err(TrySendError::Full(_)) => {
                self.set_error_status_message("too many pending requests, try again")
            }
        }
    }

    fn render(&self, frame: &mut Frame) {
        let area = frame.area();
        let has_status = self.status_message.is_some() && area.height >= 12;
        let mut constraints = vec![Constraint::Length(4), Constraint::Min(6)];
        if has_status {
            constraints.push(Constraint::Length(3));
        }
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(area);
        self.render_header(frame, chunks[0]);
        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(chunks[1]);
        self.render_market(frame, body[0]);
        let side = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
            .split(body[1]);
        self.render_balances(frame, side[0]);
        self.render_orders(frame, side[1]);
        if has_status {
            self.render_status(frame, chunks[2]);
        }
        if let Some(input) = &self.input {
            self.render_order_dialog(frame, area, input);
        }
        if let Some(prompt) = &self.prompt {
            self.render_prompt(frame, area, prompt);
        }
        if self.exit_confirmation {
            self.render_exit_confirmation(frame);
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let connection_color = if self.connection == "live" {
            Color::LightGreen
        } else {
            Color::LightRed
        };
        let lines = vec![
            Line::from(vec![
                Span::raw("stream "),
                Span::styled(
                    self.connection.clone(),
                    Style::default()
                        .fg(connection_color)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw(format!(
                    " | {} pairs | marked {}",
                    self.market.len(),
                    self.marked.len()
                )),
            ]),
            Line::from(
                "Tab focus | a add | d remove | space mark | s/r sort | e export | i import | b buy | S sell | c cancel | h view | R refresh | q quit",
            ),
        ];
        let paragraph = Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(Block::bordered().title("Gate.io Dashboard"));
        frame.render_widget(paragraph, area);
    }

    fn section_block(&self, title: &str, focus: Focus) -> Block<'static> {
        let mut label = title.to_string();
        if self.focus == focus {
            label.push_str(" *");
        }
        let style = if self.focus == focus {
            Style::default()
                .fg(Color::LightCyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        Block::bordered().title(label).border_style(style)
    }

    fn render_market(&self, frame: &mut Frame, area: Rect) {
        let block = self.section_block("Market", Focus::Market);
        let list_visible = (area.height.saturating_sub(2) as usize).saturating_sub(1);
        let sort = self.market.sort_state();
        let headers: Vec<String> = MarketColumn::ALL
            .iter()
            .map(|column| {
                if *column == sort.column {
                    format!("{}{}", column.header(), sort.arrow())
                } else {
                    column.header().to_string()
                }
            })
            .collect();
        let mut lines = vec![Line::from(format!(
            "  {}",
            table_line(&headers, &MARKET_WIDTHS, &MARKET_ALIGNS)
        ))];
        if self.market.is_empty() {
            lines.push(Line::from("no pairs tracked, press a to add one"));
        }
        let len = self.market.len();
        let selected_idx = clamp_index(self.selected_market, len);
        let (start, end) = visible_range(len, list_visible, selected_idx);
        for (idx, row) in self
            .market
            .rows()
            .iter()
            .enumerate()
            .skip(start)
            .take(end.saturating_sub(start))
        {
            let mark = if self.marked.contains(&row.pair) { "+ " } else { "  " };
            let text = format!(
                "{mark}{}",
                table_line(&row.cells(), &MARKET_WIDTHS, &MARKET_ALIGNS)
            );
            let selected = idx == selected_idx && self.focus == Focus::Market;
            let style = if selected {
                row_style(true)
            } else {
                match row.trend() {
                    Trend::Up => Style::default().fg(Color::Green),
                    Trend::Down => Style::default().fg(Color::Red),
                    Trend::Flat => Style::default(),
                }
            };
            lines.push(Line::styled(text, style));
        }
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn balance_title(&self) -> String {
        let mut title = "Account".to_string();
        if let Some(total) = self.balances.total_usdt() {
            title.push_str(&format!(" | total {} USDT", format_two(total)));
        }
        if self.balances.hidden() > 0 {
            title.push_str(&format!(
                " | {} below {}",
                self.balances.hidden(),
                self.balances.threshold()
            ));
        }
        if let Some(fetched) = self.balances.fetched_at_ms() {
            title.push_str(&format!(" | {}", format_time_ms(fetched)));
        }
        title
    }

    fn render_balances(&self, frame: &mut Frame, area: Rect) {
        let block = self.section_block(&self.balance_title(), Focus::Balances);
        let list_visible = (area.height.saturating_sub(2) as usize).saturating_sub(1);
        let sort = self.balances.sort_state();
        let headers: Vec<String> = BalanceColumn::ALL
            .iter()
            .map(|column| {
                if *column == sort.column {
                    format!("{}{}", column.header(), sort.arrow())
                } else {
                    column.header().to_string()
                }
            })
            .collect();
        let mut lines = vec![Line::from(table_line(
            &headers,
            &BALANCE_WIDTHS,
            &BALANCE_ALIGNS,
        ))];
        if !self.balances.loaded() {
            lines.push(Line::from("loading balances..."));
        } else if self.balances.is_empty() {
            lines.push(Line::from("no balances above the threshold"));
        }
        let len = self.balances.len();
        let selected_idx = clamp_index(self.selected_balance, len);
        let (start, end) = visible_range(len, list_visible, selected_idx);
        for (idx, row) in self
            .balances
            .rows()
            .iter()
            .enumerate()
            .skip(start)
            .take(end.saturating_sub(start))
        {
            let text = table_line(&BalanceTable::cells(row), &BALANCE_WIDTHS, &BALANCE_ALIGNS);
            let selected = idx == selected_idx && self.focus == Focus::Balances;
            lines.push(Line::styled(text, row_style(selected)));
        }
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn order_rows(&self) -> (String, Vec<String>) {
        match self.orders_view {
            OrdersView::Open | OrdersView::Finished => {
                let orders = if self.orders_view == OrdersView::Open {
                    &self.open_orders
                } else {
                    &self.finished_orders
                };
                let header = format_columns(&[
                    ("TIME", ColumnAlign::Left, 19),
                    ("SIDE", ColumnAlign::Left, 4),
                    ("PRICE", ColumnAlign::Right, 12),
                    ("AMOUNT", ColumnAlign::Right, 12),
                    ("LEFT", ColumnAlign::Right, 12),
                    ("STATUS", ColumnAlign::Left, 9),
                    ("ID", ColumnAlign::Left, 14),
                ]);
                let rows = orders
                    .iter()
                    .map(|order| {
                        let time = order.create_time_ms.map(format_time_ms).unwrap_or_default();
                        let price = order.price.map(format_price).unwrap_or_else(|| "--".into());
                        let amount = format_price(order.amount);
                        let left = order.left.map(format_price).unwrap_or_else(|| "--".into());
                        format_columns(&[
                            (time.as_str(), ColumnAlign::Left, 19),
                            (order.side.as_str(), ColumnAlign::Left, 4),
                            (price.as_str(), ColumnAlign::Right, 12),
                            (amount.as_str(), ColumnAlign::Right, 12),
                            (left.as_str(), ColumnAlign::Right, 12),
                            (order.status.as_str(), ColumnAlign::Left, 9),
                            (order.id.as_str(), ColumnAlign::Left, 14),
                        ])
                    })
                    .collect();
                (header, rows)
            }
            OrdersView::Trades => {
                let header = format_columns(&[
                    ("TIME", ColumnAlign::Left, 19),
                    ("SIDE", ColumnAlign::Left, 4),
                    ("PRICE", ColumnAlign::Right, 12),
                    ("AMOUNT", ColumnAlign::Right, 12),
                    ("FEE", ColumnAlign::Right, 14),
                    ("ORDER", ColumnAlign::Left, 14),
                ]);
                let rows = self
                    .trades
                    .iter()
                    .map(|trade| {
                        let time = trade.create_time_ms.map(format_time_ms).unwrap_or_default();
                        let price = format_price(trade.price);
                        let amount = format_price(trade.amount);
                        let fee = match (trade.fee, trade.fee_currency.as_deref()) {
                            (Some(fee), Some(currency)) => format!("{} {currency}", format_price(fee)),
                            (Some(fee), None) => format_price(fee),
                            _ => "--".to_string(),
                        };
                        format_columns(&[
                            (time.as_str(), ColumnAlign::Left, 19),
                            (trade.side.as_str(), ColumnAlign::Left, 4),
                            (price.as_str(), ColumnAlign::Right, 12),
                            (amount.as_str(), ColumnAlign::Right, 12),
                            (fee.as_str(), ColumnAlign::Right, 14),
                            (trade.order_id.as_str(), ColumnAlign::Left, 14),
                        ])
                    })
                    .collect();
                (header, rows)
            }
            OrdersView::Log => {
                let header = format_columns(&[
                    ("TIME", ColumnAlign::Left, 19),
                    ("RESULT", ColumnAlign::Left, 6),
                    ("MESSAGE", ColumnAlign::Left, 48),
                ]);
                let rows = self
                    .log_for_selected()
                    .into_iter()
                    .map(|entry| {
                        let time = entry.timestamp.format("%d-%m-%Y %H:%M:%S").to_string();
                        let result = if entry.record.success() { "ok" } else { "failed" };
                        format_columns(&[
                            (time.as_str(), ColumnAlign::Left, 19),
                            (result, ColumnAlign::Left, 6),
                            (entry.record.message(), ColumnAlign::Left, 48),
                        ])
                    })
                    .collect();
                (header, rows)
            }
        }
    }

    fn render_orders(&self, frame: &mut Frame, area: Rect) {
        let title = match self.selected_pair() {
            Some(pair) => format!("{} | {pair}", self.orders_view.title()),
            None => self.orders_view.title().to_string(),
        };
        let block = self.section_block(&title, Focus::Orders);
        let list_visible = (area.height.saturating_sub(2) as usize).saturating_sub(1);
        let (header, rows) = self.order_rows();
        let mut lines = vec![Line::from(header)];
        if rows.is_empty() {
            lines.push(Line::from("nothing to show"));
        }
        let selected_idx = clamp_index(self.selected_order, rows.len());
        let (start, end) = visible_range(rows.len(), list_visible, selected_idx);
        for (idx, row) in rows
            .into_iter()
            .enumerate()
            .skip(start)
            .take(end.saturating_sub(start))
        {
            let selected = idx == selected_idx && self.focus == Focus::Orders;
            lines.push(Line::styled(row, row_style(selected)));
        }
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_status(&self, frame: &mut Frame, area: Rect) {
        if let Some(message) = &self.status_message {
            let color = if self.status_is_error {
                Color::Red
            } else {
                Color::Yellow
            };
            let status = Paragraph::new(message.as_str())
                .style(Style::default().fg(color))
                .alignment(Alignment::Left)
                .block(Block::bordered().title("Status"));
            frame.render_widget(status, area);
        }
    }

    fn order_field_span(label: &str, value: &str, active: bool) -> Line<'static> {
        let mut style = Style::default().fg(Color::White);
        if active {
            style = style
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::REVERSED);
        }
        let shown = if value.is_empty() {
            "<empty>".to_string()
        } else {
            value.to_string()
        };
        Line::from(vec![Span::raw(format!("{label} ")), Span::styled(shown, style)])
    }

    fn render_order_dialog(&self, frame: &mut Frame, area: Rect, input: &OrderInputState) {
        if area.width < 20 || area.height < 6 {
            return;
        }
        let popup = centered(area, area.width.saturating_sub(10).clamp(30, 60), 7);
        let side_label = match input.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let mut lines = vec![
            Self::order_field_span(
                "Price ",
                &input.price,
                input.active_field == OrderInputField::Price,
            ),
            Self::order_field_span(
                "Amount",
                &input.amount,
                input.active_field == OrderInputField::Amount,
            ),
            Line::from("Enter submit | Esc cancel | Tab switch field"),
        ];
        if let Some(err) = &input.error {
            lines.push(Line::from(Span::styled(
                err.as_str(),
                Style::default().fg(Color::LightRed),
            )));
        }
        let paragraph = Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(Block::bordered().title(format!("{side_label} {} (limit)", input.pair)));
        frame.render_widget(Clear, popup);
        frame.render_widget(paragraph, popup);
    }

    fn render_prompt(&self, frame: &mut Frame, area: Rect, prompt: &PromptState) {
        if area.width < 20 || area.height < 5 {
            return;
        }
        let popup = centered(area, area.width.saturating_sub(10).clamp(30, 70), 5);
        let lines = vec![
            Line::from(Span::styled(
                format!("{}_", prompt.value),
                Style::default().fg(Color::Yellow),
            )),
            Line::from("Enter confirm | Esc cancel"),
        ];
        let paragraph = Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(Block::bordered().title(prompt.kind.title()));
        frame.render_widget(Clear, popup);
        frame.render_widget(paragraph, popup);
    }

    fn render_exit_confirmation(&self, frame: &mut Frame) {
        let area = frame.area();
        if area.width < 24 || area.height < 5 {
            return;
        }
        let popup = centered(area, area.width.saturating_sub(20).clamp(28, 50), 6);
        let lines = vec![
            Line::from(Span::styled(
                "Quit the dashboard?",
                Style::default()
                    .fg(Color::LightRed)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from("Y/Enter quit | N/Esc stay"),
            Line::from("q again also quits | Ctrl+C quits now"),
        ];
        let paragraph = Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(Block::bordered().title("Confirm"));
        frame.render_widget(Clear, popup);
        frame.render_widget(paragraph, popup);
    }
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    let left = area.x + (area.width.saturating_sub(width)) / 2;
    let top = area.y + (area.height.saturating_sub(height)) / 2;
    Rect::new(left, top, width, height)
}

fn table_line(cells: &[String], widths: &[usize], aligns: &[ColumnAlign]) -> String {
    let columns: Vec<(&str, ColumnAlign, usize)> = cells
        .iter()
        .zip(widths)
        .zip(aligns)
        .map(|((cell, width), align)| (cell.as_str(), *align, *width))
        .collect();
    format_columns(&columns)
}

#[derive(Clone, Copy)]
enum ColumnAlign {
    Left,
    Right,
}

fn row_style(selected: bool) -> Style {
    if selected {
        Style::default()
            .bg(Color::LightCyan)
            .fg(Color::Black)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    }
}

fn format_columns(columns: &[(&str, ColumnAlign, usize)]) -> String {
    let mut row = String::new();
    for (idx, (value, align, width)) in columns.iter().enumerate() {
        let clipped = clip_to_width(value, *width);
        row.push_str(&pad_to_width(&clipped, *width, *align));
        if idx + 1 != columns.len() {
            row.push(' ');
        }
    }
    row
}

fn clip_to_width(value: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    if UnicodeWidthStr::width(value) <= width {
        return value.to_string();
    }
    let mut result = String::new();
    let mut remaining = width.saturating_sub(1);
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if ch_width > remaining {
            break;
        }
        result.push(ch);
        remaining = remaining.saturating_sub(ch_width);
    }
    result.push('…');
    result
}

fn pad_to_width(value: &str, width: usize, align: ColumnAlign) -> String {
    let current = UnicodeWidthStr::width(value);
    if current >= width {
        return value.to_string();
    }
    let padding = " ".repeat(width - current);
    match align {
        ColumnAlign::Left => format!("{value}{padding}"),
        ColumnAlign::Right => format!("{padding}{value}"),
    }
}

fn clamp_index(idx: usize, len: usize) -> usize {
    if len == 0 { 0 } else { idx.min(len - 1) }
}

fn visible_range(len: usize, visible: usize, selected: usize) -> (usize, usize) {
    if len == 0 || visible == 0 {
        return (0, 0);
    }
    if len <= visible {
        return (0, len);
    }
    let max_start = len - visible;
    let clamped = clamp_index(selected, len);
    let start = clamped.saturating_sub(visible - 1).min(max_start);
    (start, start + visible)
}
