//! Line-oriented renderer for the markdown-ish dialect models reply in.

/// Styled run of text inside a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inline {
    Plain(String),
    Bold(String),
    Italic(String),
    Code(String),
}

impl Inline {
    pub fn text(&self) -> &str {
        match self {
            Inline::Plain(s) | Inline::Bold(s) | Inline::Italic(s) | Inline::Code(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderBlock {
    Paragraph(Vec<Inline>),
    Heading { level: u8, spans: Vec<Inline> },
    CodeBlock { language: Option<String>, lines: Vec<String> },
    BulletItem(Vec<Inline>),
    /// `index` is the number as written, not renumbered
    OrderedItem { index: String, spans: Vec<Inline> },
    Rule,
    Blank,
}

const FENCE: &str = "```";

pub fn render(text: &str) -> Vec<RenderBlock> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        i += 1;

        if line.trim_start().starts_with(FENCE) {
            let tag = line.trim()[FENCE.len()..].trim();
            let language = (!tag.is_empty()).then(|| tag.to_string());
            let mut code = Vec::new();
            while i < lines.len() && !is_closing_fence(lines[i]) {
                code.push(lines[i].to_string());
                i += 1;
            }
            // skip the closing fence, if it has arrived
            i += 1;
            blocks.push(RenderBlock::CodeBlock {
                language,
                lines: code,
            });
            continue;
        }

        blocks.push(render_line(line));
    }

    blocks
}

fn is_closing_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= FENCE.len() && trimmed.chars().all(|c| c == '`')
}

fn render_line(line: &str) -> RenderBlock {
    if let Some((level, rest)) = heading(line) {
        return RenderBlock::Heading {
            level,
            spans: parse_inline(rest),
        };
    }
    if let Some(rest) = bullet(line) {
        return RenderBlock::BulletItem(parse_inline(rest));
    }
    if let Some((index, rest)) = ordered(line) {
        return RenderBlock::OrderedItem {
            index: index.to_string(),
            spans: parse_inline(rest),
        };
    }
    if is_rule(line) {
        return RenderBlock::Rule;
    }
    if line.trim().is_empty() {
        return RenderBlock::Blank;
    }
    RenderBlock::Paragraph(parse_inline(line))
}

fn heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if !(1..=3).contains(&hashes) {
        return None;
    }
    let rest = line[hashes..].strip_prefix(' ')?;
    Some((hashes as u8, rest))
}

/// Strip one whitespace character following the marker.
fn after_marker(rest: &str) -> Option<&str> {
    let ch = rest.chars().next().filter(|c| c.is_whitespace())?;
    Some(&rest[ch.len_utf8()..])
}

fn bullet(line: &str) -> Option<&str> {
    let rest = line.trim_start();
    let rest = rest.strip_prefix('-').or_else(|| rest.strip_prefix('*'))?;
    after_marker(rest)
}

fn ordered(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start();
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let (index, rest) = rest.split_at(digits);
    let rest = after_marker(rest.strip_prefix('.')?)?;
    Some((index, rest))
}

fn is_rule(line: &str) -> bool {
    let trimmed = line.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first @ ('-' | '=' | '_')) => trimmed.len() >= 3 && chars.all(|c| c == first),
        _ => false,
    }
}

/// Left-to-right inline scan. At each position try code, then bold, then
/// italic; the first closing delimiter wins and nothing nests.
pub fn parse_inline(text: &str) -> Vec<Inline> {
    let mut spans = Vec::new();
    let mut plain = String::new();
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];

        if let Some((span, used)) = code_span(rest)
            .or_else(|| bold_span(rest))
            .or_else(|| italic_span(rest))
        {
            if !plain.is_empty() {
                spans.push(Inline::Plain(std::mem::take(&mut plain)));
            }
            spans.push(span);
            pos += used;
            continue;
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        plain.push(ch);
        pos += ch.len_utf8();
    }

    if !plain.is_empty() {
        spans.push(Inline::Plain(plain));
    }
    spans
}

fn code_span(rest: &str) -> Option<(Inline, usize)> {
    let body = rest.strip_prefix('`')?;
    let end = body.find('`').filter(|&end| end > 0)?;
    Some((Inline::Code(body[..end].to_string()), end + 2))
}

fn bold_span(rest: &str) -> Option<(Inline, usize)> {
    let body = rest.strip_prefix("**")?;
    let end = body.find('*').filter(|&end| end > 0)?;
    if !body[end..].starts_with("**") {
        return None;
    }
    Some((Inline::Bold(body[..end].to_string()), end + 4))
}

fn italic_span(rest: &str) -> Option<(Inline, usize)> {
    let body = rest.strip_prefix('*')?;
    let end = body.find('*').filter(|&end| end > 0)?;
    Some((Inline::Italic(body[..end].to_string()), end + 2))
}

/// Memoizes the last render so redraws without new text are free.
#[derive(Debug, Default)]
pub struct RenderCache {
    source: String,
    blocks: Vec<RenderBlock>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, text: &str) -> &[RenderBlock] {
        if self.source != text {
            self.source.clear();
            self.source.push_str(text);
            self.blocks = render(text);
        }
        &self.blocks
    }
}
