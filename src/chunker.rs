//! Content chunker: splits oversized content into ordered pieces that respect
//! structural boundaries, and joins translated pieces back in order.
//!
//! Block-structured content (`<!-- wp:name --> ... <!-- /wp:name -->`) is
//! parsed with a small depth-tracked scanner; only top-level blocks are split
//! points. Content without block markers falls back to closing-tag
//! boundaries, then blank-line runs, then a single whole-content chunk.

/// Separator used when joining chunk translations back together.
const CHUNK_JOIN: &str = "\n\n";

/// Closing tags treated as paragraph/heading split points in the fallback path.
const CLOSING_TAG_BOUNDARIES: &[&str] = &[
    "</p>", "</h1>", "</h2>", "</h3>", "</h4>", "</h5>", "</h6>", "</li>", "</blockquote>",
    "</div>",
];

/// A parsed structural block. `span` is the byte range covering the opener
/// comment through the matching closer (or the whole self-closing comment).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    pub name: String,
    /// Raw attribute text between the block name and the comment close, if any.
    pub attributes: Option<String>,
    pub children: Vec<BlockNode>,
    pub span: (usize, usize),
}

/// True iff `content` exceeds the given character budget.
pub fn needs_chunking(content: &str, max_length: usize) -> bool {
    content.len() > max_length
}

/// Split `content` into ordered chunks, each at most `max_length` bytes unless
/// a single atomic unit alone exceeds the budget (it then becomes its own
/// oversized chunk — a structural unit is never cut in the middle).
pub fn split(content: &str, max_length: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let units = structural_units(content);
    pack_units(&units, max_length)
}

/// Join independently translated chunks back in original order.
pub fn join(chunks: &[String]) -> String {
    chunks.join(CHUNK_JOIN)
}

/// Decompose content into ordered atomic units using the first heuristic that
/// yields more than one piece: top-level blocks, closing-tag boundaries,
/// blank-line runs. Falls back to the whole content as one unit.
fn structural_units(content: &str) -> Vec<String> {
    let blocks = parse_blocks(content);
    if !blocks.is_empty() {
        return block_units(content, &blocks);
    }

    let by_tags = split_on_closing_tags(content);
    if by_tags.len() > 1 {
        return by_tags;
    }

    let by_blank_lines = split_on_blank_lines(content);
    if by_blank_lines.len() > 1 {
        return by_blank_lines;
    }

    vec![content.trim().to_string()]
}

/// Greedy accumulation: add units to the current chunk until the next one
/// would push it past `max_length`, then start a new chunk with that unit.
fn pack_units(units: &[String], max_length: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for unit in units {
        if unit.is_empty() {
            continue;
        }
        if current.is_empty() {
            current.push_str(unit);
            continue;
        }
        if current.len() + CHUNK_JOIN.len() + unit.len() > max_length {
            chunks.push(std::mem::take(&mut current));
            current.push_str(unit);
        } else {
            current.push_str(CHUNK_JOIN);
            current.push_str(unit);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Map top-level blocks plus any non-whitespace text between them to units,
/// in document order.
fn block_units(content: &str, blocks: &[BlockNode]) -> Vec<String> {
    let mut units = Vec::new();
    let mut cursor = 0;
    for block in blocks {
        let (start, end) = block.span;
        let gap = &content[cursor..start];
        if !gap.trim().is_empty() {
            units.push(gap.trim().to_string());
        }
        units.push(content[start..end].trim().to_string());
        cursor = end;
    }
    let tail = &content[cursor..];
    if !tail.trim().is_empty() {
        units.push(tail.trim().to_string());
    }
    units
}

// --- Block comment scanner ---

/// One scanned block-delimiter comment.
enum BlockMarker {
    Open { name: String, attributes: Option<String> },
    Close { name: String },
    SelfClosing { name: String, attributes: Option<String> },
}

/// Parse the ordered list of top-level blocks in `content`. Content without
/// any block markers yields an empty list. Depth is tracked explicitly so a
/// nested block never terminates its parent.
pub fn parse_blocks(content: &str) -> Vec<BlockNode> {
    let mut top_level = Vec::new();
    // Stack of (node under construction, opener start offset).
    let mut stack: Vec<BlockNode> = Vec::new();
    let mut offset = 0;

    while let Some(comment_start) = content[offset..].find("<!--") {
        let start = offset + comment_start;
        let Some(comment_len) = content[start..].find("-->") else {
            break;
        };
        let end = start + comment_len + 3;
        let interior = content[start + 4..start + comment_len].trim();
        offset = end;

        let Some(marker) = parse_marker(interior) else {
            continue;
        };

        match marker {
            BlockMarker::SelfClosing { name, attributes } => {
                let node = BlockNode {
                    name,
                    attributes,
                    children: Vec::new(),
                    span: (start, end),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => top_level.push(node),
                }
            }
            BlockMarker::Open { name, attributes } => {
                stack.push(BlockNode {
                    name,
                    attributes,
                    children: Vec::new(),
                    span: (start, end),
                });
            }
            BlockMarker::Close { name } => {
                // Pop the innermost open block with this name; unbalanced
                // closers are ignored.
                let Some(pos) = stack.iter().rposition(|n| n.name == name) else {
                    continue;
                };
                // Anything deeper than the matched opener was never closed;
                // fold it into the matched block as-is.
                let mut node = stack.remove(pos);
                for orphan in stack.split_off(pos) {
                    node.children.push(orphan);
                }
                node.span.1 = end;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => top_level.push(node),
                }
            }
        }
    }

    // Unclosed openers left on the stack are treated as self-contained up to
    // their opener comment; they are dropped from the structural view.
    top_level
}

/// Classify one comment interior as a block marker, if it is one.
fn parse_marker(interior: &str) -> Option<BlockMarker> {
    if let Some(rest) = interior.strip_prefix("/wp:") {
        let name = rest.split_whitespace().next()?.to_string();
        return Some(BlockMarker::Close { name });
    }
    let rest = interior.strip_prefix("wp:")?;
    let self_closing = rest.ends_with('/');
    let rest = rest.strip_suffix('/').unwrap_or(rest).trim_end();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_string();
    if name.is_empty() {
        return None;
    }
    let attributes = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(if self_closing {
        BlockMarker::SelfClosing { name, attributes }
    } else {
        BlockMarker::Open { name, attributes }
    })
}

// --- Fallback splitters ---

/// Split after each closing paragraph/heading tag. Case-insensitive match on
/// a fixed closing-tag set; the tag stays with the piece it closes.
fn split_on_closing_tags(content: &str) -> Vec<String> {
    let lower = content.to_lowercase();
    let mut cut_points = Vec::new();
    for tag in CLOSING_TAG_BOUNDARIES {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(tag) {
            cut_points.push(from + pos + tag.len());
            from += pos + tag.len();
        }
    }
    cut_points.sort_unstable();
    cut_points.dedup();

    let mut pieces = Vec::new();
    let mut cursor = 0;
    for cut in cut_points {
        let piece = content[cursor..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        cursor = cut;
    }
    let tail = content[cursor..].trim();
    if !tail.is_empty() {
        pieces.push(tail.to_string());
    }
    pieces
}

/// Split on runs of blank lines (two or more newlines, allowing horizontal
/// whitespace on the blank lines).
fn split_on_blank_lines(content: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut blank_run = 0;

    for line in content.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            continue;
        }
        if blank_run > 0 && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        blank_run = 0;
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str, body: &str) -> String {
        format!("<!-- wp:{name} -->\n{body}\n<!-- /wp:{name} -->")
    }

    #[test]
    fn short_content_does_not_need_chunking() {
        assert!(!needs_chunking("hello", 100));
        assert!(needs_chunking(&"x".repeat(101), 100));
    }

    #[test]
    fn parses_nested_blocks_at_top_level_only() {
        let content = format!(
            "{}\n{}",
            block("columns", &block("column", "<p>inner</p>")),
            block("paragraph", "<p>after</p>")
        );
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "columns");
        assert_eq!(blocks[0].children.len(), 1);
        assert_eq!(blocks[0].children[0].name, "column");
        assert_eq!(blocks[1].name, "paragraph");
    }

    #[test]
    fn parses_attributes_and_self_closing_blocks() {
        let content = r#"<!-- wp:image {"id":42} --><img/><!-- /wp:image --><!-- wp:spacer {"height":20} /-->"#;
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].attributes.as_deref(), Some(r#"{"id":42}"#));
        assert_eq!(blocks[1].name, "spacer");
        assert!(blocks[1].children.is_empty());
    }

    #[test]
    fn block_split_never_cuts_inside_a_block() {
        // 5 blocks of ~6000 chars, budget 12000 -> 3 chunks, boundaries on
        // block edges.
        let body = "y".repeat(5900);
        let content: Vec<String> = (0..5).map(|_| block("paragraph", &body)).collect();
        let content = content.join("\n");
        assert!(content.len() > 12_000);

        let chunks = split(&content, 12_000);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 12_000);
            assert!(chunk.starts_with("<!-- wp:paragraph -->"));
            assert!(chunk.ends_with("<!-- /wp:paragraph -->"));
        }
    }

    #[test]
    fn oversized_single_block_becomes_its_own_chunk() {
        let huge = block("paragraph", &"z".repeat(20_000));
        let small = block("paragraph", "short");
        let content = format!("{small}\n{huge}\n{small}");
        let chunks = split(&content, 1_000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].len() > 1_000);
    }

    #[test]
    fn block_round_trip_preserves_text() {
        let content = format!("{}\n{}", block("paragraph", "one"), block("paragraph", "two"));
        let chunks = split(&content, 30);
        assert_eq!(chunks.len(), 2);
        let rejoined = join(&chunks);
        // Equivalent aside from inter-chunk separator whitespace.
        assert_eq!(
            rejoined.split_whitespace().collect::<Vec<_>>(),
            content.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[test]
    fn falls_back_to_closing_tags_without_block_markers() {
        let content = "<p>first paragraph</p><h2>heading</h2><p>second paragraph</p>";
        let chunks = split(content, 30);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            // No chunk starts mid-paragraph.
            assert!(chunk.starts_with('<'), "bad chunk start: {chunk}");
        }
    }

    #[test]
    fn falls_back_to_blank_lines_for_plain_text() {
        let content = "para one line\n\npara two line\n\npara three line";
        let chunks = split(content, 20);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn unsplittable_content_is_a_single_chunk() {
        let content = "a".repeat(500);
        let chunks = split(&content, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], content);
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(split("", 100).is_empty());
    }

    #[test]
    fn join_preserves_order() {
        let chunks = vec!["uno".to_string(), "dos".to_string(), "tres".to_string()];
        assert_eq!(join(&chunks), "uno\n\ndos\n\ntres");
    }
}
