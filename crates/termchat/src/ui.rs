use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};
use termchat_core::{render as render_markup, Inline, RenderBlock};

use crate::app::{App, EntryKind};

const RULE_WIDTH: usize = 40;

fn inline_spans(spans: &[Inline], base: Style) -> Vec<Span<'static>> {
    spans
        .iter()
        .map(|inline| {
            let style = match inline {
                Inline::Plain(_) => base,
                Inline::Bold(_) => base.add_modifier(Modifier::BOLD),
                Inline::Italic(_) => base.add_modifier(Modifier::ITALIC),
                Inline::Code(_) => base.fg(Color::Magenta),
            };
            Span::styled(inline.text().to_string(), style)
        })
        .collect()
}

fn code_box(language: Option<&str>, lines: &[String]) -> Vec<Line<'static>> {
    let style = Style::default().fg(Color::Green);
    let tag_width = language.map_or(0, |lang| lang.chars().count() + 1);
    let inner = lines
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(0)
        .max(tag_width);
    let border = inner + 2;

    let top = match language {
        Some(lang) => format!(
            "+-[{}]{}+",
            lang,
            "-".repeat(border - lang.chars().count() - 3)
        ),
        None => format!("+{}+", "-".repeat(border)),
    };

    let mut out = vec![Line::styled(top, style)];
    for line in lines {
        let pad = inner - line.chars().count();
        out.push(Line::styled(
            format!("| {}{} |", line, " ".repeat(pad)),
            style,
        ));
    }
    out.push(Line::styled(format!("+{}+", "-".repeat(border)), style));
    out
}

/// Terminal lines for rendered blocks
pub fn block_lines(blocks: &[RenderBlock]) -> Vec<Line<'static>> {
    let mut lines = Vec::new();

    for block in blocks {
        match block {
            RenderBlock::Paragraph(spans) => {
                lines.push(Line::from(inline_spans(spans, Style::default())));
            }
            RenderBlock::Heading { level, spans } => {
                let marker = match level {
                    1 => "===",
                    2 => "==",
                    _ => "---",
                };
                let style = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
                let mut heading = vec![Span::styled(format!("{} ", marker), style)];
                heading.extend(inline_spans(spans, style));
                heading.push(Span::styled(format!(" {}", marker), style));
                lines.push(Line::from(heading));
            }
            RenderBlock::CodeBlock { language, lines: code } => {
                lines.extend(code_box(language.as_deref(), code));
            }
            RenderBlock::BulletItem(spans) => {
                let mut item = vec![Span::raw("  * ")];
                item.extend(inline_spans(spans, Style::default()));
                lines.push(Line::from(item));
            }
            RenderBlock::OrderedItem { index, spans } => {
                let mut item = vec![Span::raw(format!("  {}. ", index))];
                item.extend(inline_spans(spans, Style::default()));
                lines.push(Line::from(item));
            }
            RenderBlock::Rule => {
                lines.push(Line::styled(
                    "─".repeat(RULE_WIDTH),
                    Style::default().fg(Color::DarkGray),
                ));
            }
            RenderBlock::Blank => lines.push(Line::default()),
        }
    }

    lines
}

fn label(text: &'static str, color: Color) -> Line<'static> {
    Line::from(Span::styled(
        text,
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    ))
}

fn transcript_lines(app: &mut App) -> Vec<Line<'static>> {
    let mut lines: Vec<Line<'static>> = Vec::new();

    for entry in &app.entries {
        match entry.kind {
            EntryKind::User => {
                lines.push(label("You:", Color::Cyan));
                lines.extend(entry.text.lines().map(|l| Line::from(l.to_string())));
            }
            EntryKind::Assistant => {
                lines.push(label("AI:", Color::Yellow));
                lines.extend(block_lines(&render_markup(&entry.text)));
            }
            EntryKind::Error => {
                lines.push(label("AI:", Color::Yellow));
                let style = Style::default().fg(Color::Red);
                lines.extend(entry.text.lines().map(|l| Line::styled(l.to_string(), style)));
            }
            EntryKind::Notice => {
                let style = Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::ITALIC);
                lines.extend(entry.text.lines().map(|l| Line::styled(l.to_string(), style)));
            }
        }
        lines.push(Line::default());
    }

    if let Some(streaming) = app.streaming.as_mut() {
        lines.push(label("AI:", Color::Yellow));
        if streaming.visible.is_empty() {
            // Animated ellipsis: cycles through ".", "..", "..."
            let dots = ".".repeat((app.animation_frame as usize) + 1);
            lines.push(Line::from(Span::styled(
                format!("Thinking{}", dots),
                Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::ITALIC),
            )));
        } else {
            let blocks = streaming.render.render(&streaming.visible);
            lines.extend(block_lines(blocks));
        }
    }

    lines
}

/// Rows the lines take once wrapped to `width`
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let rows: usize = lines
        .iter()
        .map(|line| line.width().div_ceil(width).max(1))
        .sum();
    rows.min(u16::MAX as usize) as u16
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let thinking = if app.session.thinking_enabled {
        "reasoning on"
    } else {
        "reasoning off"
    };

    let title = Line::from(vec![
        Span::styled(" termchat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("{} @ {} ", app.session.model, app.target_label()),
            Style::default().fg(Color::White),
        ),
        Span::styled(format!("[{}] ", thinking), Style::default().fg(Color::Gray)),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);

    let text = if app.entries.is_empty() && app.streaming.is_none() {
        Text::from(Span::styled(
            "Type a message and press Enter. /help lists commands.",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Text::from(transcript_lines(app))
    };

    // Keep scroll bounds in sync with what is on screen
    let total = wrapped_height(&text.lines, inner.width);
    app.chat_height = inner.height;
    app.max_scroll = total.saturating_sub(inner.height);
    if app.follow || app.scroll > app.max_scroll {
        app.scroll = app.max_scroll;
    }

    let chat = Paragraph::new(text)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let border_color = if app.is_streaming() {
        Color::DarkGray
    } else {
        Color::Yellow
    };
    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" Message ");

    // Horizontal scroll keeps the cursor visible
    let inner_width = area.width.saturating_sub(2) as usize;
    let scroll_offset = if inner_width == 0 {
        0
    } else {
        (app.cursor + 1).saturating_sub(inner_width)
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);
    frame.render_widget(input, area);

    let cursor_x = (app.cursor - scroll_offset) as u16;
    frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let hints = if app.is_streaming() {
        " Streaming... Esc stop | PgUp/PgDn scroll "
    } else {
        " Enter send | /help commands | PgUp/PgDn scroll | Ctrl-C quit "
    };
    let footer = Paragraph::new(Span::styled(hints, Style::default().fg(Color::DarkGray)));
    frame.render_widget(footer, area);
}
