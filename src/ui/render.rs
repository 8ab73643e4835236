//! 界面渲染
//!
//! 根据 UiState 绘制：左侧对话历史（按角色着色、工具结果折叠、按宽度换行），右侧活动日志，
//! 底部输入框（错误行内显示）；待确认的工具调用以居中模态框显示参数与 diff。

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, Wrap},
    Frame,
};

use crate::core::{AgentPhase, PendingConfirmation, UiState};
use crate::memory::{Message, Role};

/// 单条消息在 UI 中显示的最大字符数
const MAX_DISPLAY_CHARS: usize = 600;
/// 工具结果的显示上限（更短，多为文件内容或命令输出）
const MAX_TOOL_DISPLAY_CHARS: usize = 280;
/// 模态框中 diff 最多显示的行数
const MAX_DIFF_LINES: usize = 40;

/// 对过长内容做折叠：保留前 N 字 + 省略提示
fn truncate_for_display(message: &Message) -> String {
    let limit = if message.role == Role::Tool {
        MAX_TOOL_DISPLAY_CHARS
    } else {
        MAX_DISPLAY_CHARS
    };
    let mut text = message.content.clone();
    if !message.tool_calls.is_empty() {
        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.tool_name.as_str()).collect();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("→ {}", names.join(", ")));
    }
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    let head: String = text.chars().take(limit).collect();
    format!("{}\n... [已折叠，共 {} 字]", head, count)
}

/// 将内容按宽度换行（按字符数，避免在 UTF-8 中间截断）
fn wrap_text(s: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![s.to_string()];
    }
    let mut lines = Vec::new();
    for para in s.split('\n') {
        let mut line = String::new();
        for ch in para.chars() {
            if line.chars().count() >= width {
                lines.push(std::mem::take(&mut line));
            }
            line.push(ch);
        }
        lines.push(line);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

fn phase_label(state: &UiState) -> String {
    match state.phase {
        AgentPhase::Idle => "空闲".to_string(),
        AgentPhase::Thinking => "思考中…".to_string(),
        AgentPhase::ToolExecuting => state
            .active_tool
            .as_deref()
            .map(|t| format!("执行: {}", t))
            .unwrap_or_else(|| "执行中…".to_string()),
        AgentPhase::AwaitingConfirmation => "等待确认".to_string(),
        AgentPhase::Checkpointing => "检查点…".to_string(),
        AgentPhase::Error => "错误".to_string(),
    }
}

/// 绘制一帧；将 (总行数, 可视高度) 写入 out 供外部 clamp 滚动
pub fn draw(
    f: &mut Frame,
    state: &UiState,
    input_buffer: &str,
    conversation_scroll: usize,
    out: &mut (usize, usize),
) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(5)])
        .split(f.area());
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(rows[0]);

    *out = draw_conversation(f, state, cols[0], conversation_scroll);
    draw_activity(f, state, cols[1]);
    draw_input(f, state, input_buffer, rows[1]);

    if let Some(pending) = &state.pending_confirmation {
        draw_confirmation(f, pending);
    }
}

fn draw_conversation(f: &mut Frame, state: &UiState, area: Rect, scroll: usize) -> (usize, usize) {
    let content_width = area.width.saturating_sub(3) as usize;
    let it = &state.iteration;
    let title = format!(
        " Beecode │ {} │ {} │ 轮次 {}/{} │ tokens {} ",
        state.model_name,
        phase_label(state),
        it.turns_taken,
        it.turns_limit,
        it.tokens_accumulated
    );
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let mut text_lines: Vec<Line> = Vec::new();
    for m in state.history.iter().filter(|m| m.role != Role::System) {
        if !text_lines.is_empty() {
            text_lines.push(Line::from(Span::raw("")));
        }
        let (prefix, color) = match m.role {
            Role::User => ("You  ", Color::Cyan),
            Role::Assistant => ("Bee  ", Color::Green),
            Role::Tool => ("Tool ", Color::Magenta),
            Role::System | Role::Unknown => ("Sys  ", Color::Gray),
        };
        let display_text = truncate_for_display(m);
        for (i, line) in wrap_text(&display_text, content_width.max(20)).into_iter().enumerate() {
            let pref = if i == 0 { prefix } else { "     " };
            text_lines.push(Line::from(vec![
                Span::styled(pref, Style::default().fg(color).add_modifier(Modifier::BOLD)),
                Span::raw(line),
            ]));
        }
    }

    let content_height = area.height.saturating_sub(2) as usize;
    let total_lines = text_lines.len();
    let scroll_offset = scroll.min(total_lines.saturating_sub(content_height));

    let paragraph = Paragraph::new(Text::from(text_lines))
        .block(block)
        .scroll((scroll_offset as u16, 0));
    f.render_widget(paragraph, area);

    if total_lines > content_height {
        let mut scrollbar_state = ScrollbarState::new(total_lines)
            .position(scroll_offset)
            .viewport_content_length(content_height);
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .thumb_symbol("█")
            .track_symbol(Some("░"));
        f.render_stateful_widget(scrollbar, area, &mut scrollbar_state);
    }
    (total_lines, content_height)
}

fn draw_activity(f: &mut Frame, state: &UiState, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let start = state.activity.len().saturating_sub(height);
    let lines: Vec<Line> = state.activity[start..]
        .iter()
        .map(|l| Line::from(Span::raw(l.as_str())))
        .collect();
    let block = Block::default()
        .title(" 活动 ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_input(f: &mut Frame, state: &UiState, input_buffer: &str, area: Rect) {
    let input_prompt = if let Some(err) = &state.error_message {
        format!(" 错误: {} ", err.chars().take(60).collect::<String>())
    } else if state.input_locked {
        " 等待回复… ".to_string()
    } else {
        " 输入 ".to_string()
    };
    let border_color = if state.error_message.is_some() {
        Color::Red
    } else {
        Color::Blue
    };
    let hint = " Enter 发送 │ ↑↓ PgUp/PgDn 滚动 │ Ctrl+C 取消 │ Ctrl+L 清空 │ Ctrl+Q 退出 ";
    let input_block = Block::default()
        .title(input_prompt)
        .title_bottom(Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray))))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color));

    let input = Paragraph::new(input_buffer)
        .block(input_block)
        .wrap(Wrap { trim: false })
        .style(if state.input_locked {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        });
    f.render_widget(input, area);
}

/// 居中矩形：宽高为父区域的百分比
fn centered(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

fn diff_line(line: &str) -> Line<'_> {
    let color = if line.starts_with("+++") || line.starts_with("---") {
        Color::White
    } else if line.starts_with('+') {
        Color::Green
    } else if line.starts_with('-') {
        Color::Red
    } else if line.starts_with("@@") {
        Color::Cyan
    } else {
        Color::Gray
    };
    Line::from(Span::styled(line, Style::default().fg(color)))
}

fn draw_confirmation(f: &mut Frame, pending: &PendingConfirmation) {
    let area = centered(f.area(), 80, 70);
    let mut lines = vec![
        Line::from(vec![
            Span::styled("工具: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(pending.tool_name.as_str()),
        ]),
        Line::from(vec![
            Span::styled("参数: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(pending.arguments.chars().take(300).collect::<String>()),
        ]),
        Line::from(""),
    ];
    if let Some(diff) = &pending.diff {
        let total = diff.lines().count();
        lines.extend(diff.lines().take(MAX_DIFF_LINES).map(diff_line));
        if total > MAX_DIFF_LINES {
            lines.push(Line::from(format!("... 另有 {} 行", total - MAX_DIFF_LINES)));
        }
    }
    let block = Block::default()
        .title(" 确认执行？ ")
        .title_bottom(Line::from(Span::styled(
            " y 同意 │ n 拒绝 │ Ctrl+C 取消会话 ",
            Style::default().fg(Color::DarkGray),
        )))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::LightYellow));
    f.render_widget(Clear, area);
    f.render_widget(
        Paragraph::new(lines).block(block).wrap(Wrap { trim: false }),
        area,
    );
}
