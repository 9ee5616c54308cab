//! Positional chunker for canonical markdown.
//!
//! Splits canonical text into ordered chunks that carry their byte offset
//! and 1-based line span, so search results can point back into the source.
//! Splitting respects two hard rules: code fences are never split (a fenced
//! block is always a chunk of its own), and `seq` is contiguous from 0.
//!
//! Outside fences, consecutive paragraphs are greedily packed up to a soft
//! byte budget; a single oversized paragraph is split at line boundaries.
//! Chunk text is always an exact slice of the canonical markdown starting
//! at `pos`, so blank lines between packed paragraphs are preserved.

use crate::models::Chunk;

/// Estimated tokens per chunk when no tokenizer is bound: bytes / 4.
const BYTES_PER_TOKEN: usize = 4;

#[derive(Debug)]
struct Block {
    start: usize, // line index, 0-based
    end: usize,   // inclusive
    pos: usize,   // byte offset of first line
    bytes: usize,
    fence_language: Option<String>,
    is_fence: bool,
}

/// Split canonical markdown into chunks.
///
/// `max_bytes` is a soft budget; fenced blocks and single long lines may
/// exceed it. Whitespace-only input produces no chunks.
pub fn chunk_markdown(canonical: &str, max_bytes: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = canonical.split('\n').collect();
    let mut offsets = Vec::with_capacity(lines.len());
    let mut off = 0usize;
    for line in &lines {
        offsets.push(off);
        off += line.len() + 1;
    }

    let blocks = collect_blocks(&lines, &offsets);
    pack_blocks(canonical, &lines, &offsets, &blocks, max_bytes)
}

fn fence_marker(line: &str) -> Option<(char, usize, String)> {
    let trimmed = line.trim_start();
    for marker in ['`', '~'] {
        let count = trimmed.chars().take_while(|&c| c == marker).count();
        if count >= 3 {
            let info = trimmed[count..].trim();
            let language = info.split_whitespace().next().unwrap_or("").to_string();
            return Some((marker, count, language));
        }
    }
    None
}

fn collect_blocks(lines: &[&str], offsets: &[usize]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.is_empty() {
            i += 1;
            continue;
        }

        if let Some((marker, width, language)) = fence_marker(line) {
            // Consume until the closing fence (or EOF).
            let start = i;
            let mut end = i;
            let mut j = i + 1;
            let mut closed = false;
            while j < lines.len() {
                if let Some((m, w, info)) = fence_marker(lines[j]) {
                    if m == marker && w >= width && info.is_empty() {
                        end = j;
                        closed = true;
                        break;
                    }
                }
                j += 1;
            }
            if !closed {
                end = lines.len().saturating_sub(1);
                while end > start && lines[end].is_empty() {
                    end -= 1;
                }
            }
            let bytes = offsets[end] + lines[end].len() - offsets[start];
            blocks.push(Block {
                start,
                end,
                pos: offsets[start],
                bytes,
                fence_language: if language.is_empty() {
                    None
                } else {
                    Some(language)
                },
                is_fence: true,
            });
            i = end + 1;
            continue;
        }

        // Paragraph: maximal run of non-blank, non-fence-opening lines.
        let start = i;
        let mut end = i;
        while end + 1 < lines.len()
            && !lines[end + 1].is_empty()
            && fence_marker(lines[end + 1]).is_none()
        {
            end += 1;
        }
        let bytes = offsets[end] + lines[end].len() - offsets[start];
        blocks.push(Block {
            start,
            end,
            pos: offsets[start],
            bytes,
            fence_language: None,
            is_fence: false,
        });
        i = end + 1;
    }
    blocks
}

fn pack_blocks(
    canonical: &str,
    lines: &[&str],
    offsets: &[usize],
    blocks: &[Block],
    max_bytes: usize,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    // Current run of packed paragraph blocks, as an inclusive line range.
    let mut run: Option<(usize, usize)> = None;

    for block in blocks {
        if block.is_fence {
            if let Some((s, e)) = run.take() {
                push_chunk(&mut chunks, canonical, lines, offsets, s, e, None);
            }
            push_chunk(
                &mut chunks,
                canonical,
                lines,
                offsets,
                block.start,
                block.end,
                block.fence_language.clone(),
            );
            continue;
        }

        if block.bytes > max_bytes {
            // Oversized paragraph: flush, then split at line boundaries.
            if let Some((s, e)) = run.take() {
                push_chunk(&mut chunks, canonical, lines, offsets, s, e, None);
            }
            let mut seg_start = block.start;
            let mut seg_bytes = 0usize;
            for li in block.start..=block.end {
                let line_bytes = lines[li].len() + 1;
                if seg_bytes > 0 && seg_bytes + line_bytes > max_bytes {
                    push_chunk(&mut chunks, canonical, lines, offsets, seg_start, li - 1, None);
                    seg_start = li;
                    seg_bytes = 0;
                }
                seg_bytes += line_bytes;
            }
            push_chunk(&mut chunks, canonical, lines, offsets, seg_start, block.end, None);
            continue;
        }

        match run {
            None => run = Some((block.start, block.end)),
            Some((s, e)) => {
                // Packed text spans the blank separator lines too.
                let combined = (offsets[block.end] + lines[block.end].len()) - offsets[s];
                if combined > max_bytes {
                    push_chunk(&mut chunks, canonical, lines, offsets, s, e, None);
                    run = Some((block.start, block.end));
                } else {
                    run = Some((s, block.end));
                }
            }
        }
    }
    if let Some((s, e)) = run {
        push_chunk(&mut chunks, canonical, lines, offsets, s, e, None);
    }

    for (i, c) in chunks.iter_mut().enumerate() {
        c.seq = i as i64;
    }
    chunks
}

fn push_chunk(
    chunks: &mut Vec<Chunk>,
    canonical: &str,
    lines: &[&str],
    offsets: &[usize],
    start: usize,
    end: usize,
    language: Option<String>,
) {
    let pos = offsets[start];
    let end_byte = offsets[end] + lines[end].len();
    let text = canonical[pos..end_byte].to_string();
    let token_count = (text.len() / BYTES_PER_TOKEN) as i64;
    chunks.push(Chunk {
        seq: 0, // assigned after packing
        pos: pos as i64,
        text,
        start_line: (start + 1) as i64,
        end_line: (end + 1) as i64,
        language,
        token_count: Some(token_count),
    });
}
