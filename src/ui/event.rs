//! 事件处理
//!
//! 轮询 crossterm 键盘事件，将 Ctrl+C/Esc、Ctrl+L、Ctrl+Q 转为 Command（Cancel/Clear/Quit），
//! 其余按键交给 run_app：拼 input_buffer、Enter 提交，或在确认模态框中回答 y/n。

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc;

use crate::core::Command;

/// 应用事件：来自快捷键的 Command 或原始 KeyEvent
#[derive(Debug, Clone)]
pub enum AppEvent {
    Command(Command),
    Key(KeyEvent),
}

/// 事件处理器：持有 cmd_tx，poll 时读键盘并返回 AppEvent
pub struct EventHandler {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl EventHandler {
    pub fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { cmd_tx }
    }

    /// 非阻塞读取一个按键事件
    pub fn poll(&self) -> anyhow::Result<Option<AppEvent>> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(Some(self.handle_key(key)));
                }
            }
        }
        Ok(None)
    }

    fn handle_key(&self, key: KeyEvent) -> AppEvent {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let cmd = match key.code {
            KeyCode::Char('c') if ctrl => Command::Cancel,
            KeyCode::Esc => Command::Cancel,
            KeyCode::Char('l') if ctrl => Command::Clear,
            KeyCode::Char('q') if ctrl => Command::Quit,
            _ => return AppEvent::Key(key),
        };
        let _ = self.cmd_tx.send(cmd.clone());
        AppEvent::Command(cmd)
    }

    pub fn send_submit(&self, input: String) {
        let _ = self.cmd_tx.send(Command::Submit(input));
    }

    pub fn send_quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit);
    }

    pub fn send_confirm(&self, approved: bool) {
        let _ = self.cmd_tx.send(Command::Confirm(approved));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortcuts_forwarded_as_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = EventHandler::new(tx);
        let ev = handler.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(matches!(ev, AppEvent::Command(Command::Cancel)));
        assert_eq!(rx.try_recv().unwrap(), Command::Cancel);

        let ev = handler.handle_key(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::CONTROL));
        assert!(matches!(ev, AppEvent::Command(Command::Quit)));
        assert_eq!(rx.try_recv().unwrap(), Command::Quit);
    }

    #[test]
    fn test_plain_keys_passed_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = EventHandler::new(tx);
        let ev = handler.handle_key(KeyEvent::new(KeyCode::Char('y'), KeyModifiers::NONE));
        assert!(matches!(ev, AppEvent::Key(_)));
        assert!(rx.try_recv().is_err());
        handler.send_confirm(true);
        assert_eq!(rx.try_recv().unwrap(), Command::Confirm(true));
    }
}
