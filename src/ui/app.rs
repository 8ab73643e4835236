//! TUI 应用主循环
//!
//! 进入全屏/原始模式，每帧读取 state_rx 最新快照并处理键盘事件：
//! 有待确认调用时只接受 y/n，否则拼输入缓冲、Enter 提交；键盘轮询不阻塞，帧间 sleep 让出，会话任务与 UI 在同一运行时上交替推进。

use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::{
    event::KeyCode,
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::sync::{mpsc, watch};

use crate::core::{Command, UiState};
use crate::ui::event::{AppEvent, EventHandler};
use crate::ui::render::draw;

const FRAME_INTERVAL: Duration = Duration::from_millis(30);

/// 运行 TUI：启用原始模式与全屏，循环 poll 事件 + 渲染，退出时恢复终端
pub async fn run_app(
    state_rx: watch::Receiver<UiState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, state_rx, cmd_tx).await;
    restore_terminal(&mut terminal)?;
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    state_rx: watch::Receiver<UiState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    let event_handler = EventHandler::new(cmd_tx);
    let mut input_buffer = String::new();
    let mut conversation_scroll = 0usize;
    let mut last_history_len = 0usize;

    loop {
        let state = state_rx.borrow().clone();

        if state.history.len() != last_history_len {
            last_history_len = state.history.len();
            conversation_scroll = usize::MAX;
        }

        match event_handler.poll()? {
            Some(AppEvent::Command(Command::Quit)) => break,
            Some(AppEvent::Command(_)) => {}
            Some(AppEvent::Key(key)) if state.pending_confirmation.is_some() => match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => event_handler.send_confirm(true),
                KeyCode::Char('n') | KeyCode::Char('N') => event_handler.send_confirm(false),
                _ => {}
            },
            Some(AppEvent::Key(key)) => match key.code {
                KeyCode::Enter if !state.input_locked => {
                    let input = input_buffer.trim().to_string();
                    input_buffer.clear();
                    if matches!(input.to_lowercase().as_str(), "/exit" | "/quit") {
                        event_handler.send_quit();
                        break;
                    }
                    if !input.is_empty() {
                        event_handler.send_submit(input);
                    }
                }
                KeyCode::Backspace => {
                    input_buffer.pop();
                }
                KeyCode::Char(c) => input_buffer.push(c),
                KeyCode::Up => conversation_scroll = conversation_scroll.saturating_sub(1),
                KeyCode::Down => conversation_scroll = conversation_scroll.saturating_add(1),
                KeyCode::PageUp => conversation_scroll = conversation_scroll.saturating_sub(10),
                KeyCode::PageDown => conversation_scroll = conversation_scroll.saturating_add(10),
                KeyCode::Home => conversation_scroll = 0,
                KeyCode::End => conversation_scroll = usize::MAX,
                _ => {}
            },
            None => {}
        }

        let mut scroll_info = (0usize, 0usize);
        terminal.draw(|f| {
            draw(f, &state, &input_buffer, conversation_scroll, &mut scroll_info);
        })?;
        let (total_lines, viewport_height) = scroll_info;
        conversation_scroll = conversation_scroll.min(total_lines.saturating_sub(viewport_height));

        // 让出给同一运行时上的会话任务
        tokio::time::sleep(FRAME_INTERVAL).await;
    }
    Ok(())
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
