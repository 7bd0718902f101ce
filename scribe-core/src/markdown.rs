//! Markdown-like text ⇄ [`Block`] conversion.
//!
//! Only the block structure is recognised (headings, lists, quotes, fenced
//! code, dividers, paragraphs); inline marks stay in the text verbatim.

use crate::Block;

/// Parse markdown-like source into blocks.
///
/// Consecutive plain lines form one paragraph (joined with `\n`); blank
/// lines end it. An unterminated code fence runs to the end of input.
pub fn parse(source: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut lines = source.lines();

    while let Some(raw) = lines.next() {
        let line = raw.trim();

        if let Some(info) = line.strip_prefix("```") {
            flush_paragraph(&mut paragraph, &mut blocks);
            let info = info.trim();
            let language = (!info.is_empty()).then(|| info.to_string());
            let mut body = Vec::new();
            for code_line in lines.by_ref() {
                if code_line.trim_start().starts_with("```") {
                    break;
                }
                body.push(code_line);
            }
            blocks.push(Block::Code {
                language,
                text: body.join("\n"),
            });
            continue;
        }

        if line.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            continue;
        }

        match parse_line(line) {
            Some(block) => {
                flush_paragraph(&mut paragraph, &mut blocks);
                blocks.push(block);
            }
            None => paragraph.push(line),
        }
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    blocks
}

/// Serialize blocks back to markdown-like text.
///
/// Runs of list items of the same kind are kept tight; every other block is
/// separated by a blank line.
pub fn serialize(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut number = 0u32;
    let mut previous: Option<&Block> = None;

    for block in blocks {
        if let Some(prev) = previous {
            let tight = matches!(
                (prev, block),
                (Block::BulletItem { .. }, Block::BulletItem { .. })
                    | (Block::NumberedItem { .. }, Block::NumberedItem { .. })
            );
            out.push_str(if tight { "\n" } else { "\n\n" });
        }

        if matches!(block, Block::NumberedItem { .. }) {
            number += 1;
        } else {
            number = 0;
        }

        match block {
            Block::Heading { level, text } => {
                out.push_str(&"#".repeat(usize::from(*level)));
                out.push(' ');
                out.push_str(text);
            }
            Block::Paragraph { text } => out.push_str(text),
            Block::BulletItem { text } => {
                out.push_str("- ");
                out.push_str(text);
            }
            Block::NumberedItem { text } => {
                out.push_str(&format!("{number}. {text}"));
            }
            Block::Quote { text } => {
                out.push_str("> ");
                out.push_str(text);
            }
            Block::Code { language, text } => {
                out.push_str("```");
                out.push_str(language.as_deref().unwrap_or(""));
                out.push('\n');
                out.push_str(text);
                out.push_str("\n```");
            }
            Block::Divider => out.push_str("---"),
        }

        previous = Some(block);
    }

    out
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !paragraph.is_empty() {
        blocks.push(Block::paragraph(paragraph.join("\n")));
        paragraph.clear();
    }
}

fn parse_line(line: &str) -> Option<Block> {
    if is_divider(line) {
        return Some(Block::Divider);
    }

    let hashes = line.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        let rest = &line[hashes..];
        if rest.is_empty() || rest.starts_with(' ') {
            return Some(Block::heading(hashes as u8, rest.trim()));
        }
    }

    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(Block::BulletItem {
                text: rest.trim().to_string(),
            });
        }
    }

    if let Some(rest) = line.strip_prefix('>') {
        return Some(Block::Quote {
            text: rest.trim().to_string(),
        });
    }

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return Some(Block::NumberedItem {
                text: rest.trim().to_string(),
            });
        }
    }

    None
}

fn is_divider(line: &str) -> bool {
    let compact: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && ['-', '*', '_']
            .iter()
            .any(|marker| compact.iter().all(|c| c == marker))
}
