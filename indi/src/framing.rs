//! Frame scanner for the INDI XML stream
//!
//! An INDI server never sends a single document. It sends an endless run of
//! independent top-level elements. [`FrameBuffer`] accumulates raw bytes
//! and hands out one complete element at a time, found by tag balance:
//! locate `<`, locate the matching `>`, and for paired tags look for the
//! literal closing tag. Anything incomplete stays buffered until more bytes
//! arrive.

/// Outcome of scanning for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scan {
    /// A complete element occupying `start..end`
    Frame { start: usize, end: usize },
    /// Markup that carries no protocol data, occupying `..end`
    Skip { end: usize },
    /// Not enough bytes yet; keep everything from `start`
    NeedMore { start: usize },
    /// Paired element at `start` whose body begins at `body`; its end is
    /// found by searching for `closing`
    Open {
        start: usize,
        body: usize,
        closing: Vec<u8>,
    },
}

/// Paired element at the front of the buffer still waiting for its closing tag
#[derive(Debug)]
struct OpenElement {
    closing: Vec<u8>,
    /// Offset where the next closing-tag search resumes
    resume: usize,
}

/// Accumulating buffer that yields complete top-level XML elements
///
/// Bytes of a large element are searched for the closing tag once, not on
/// every push, so a multi-megabyte BLOB frames in linear time.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    open: Option<OpenElement>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buf.clear();
        self.open = None;
    }

    /// Next complete element, or `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(open) = self.open.as_mut() {
                return match find(&self.buf, &open.closing, open.resume) {
                    Some(pos) => {
                        let end = pos + open.closing.len();
                        self.open = None;
                        Some(self.take_frame(0, end))
                    }
                    None => {
                        // A closing tag can still straddle the end of the buffer
                        let overlap = open.closing.len() - 1;
                        open.resume = open.resume.max(self.buf.len().saturating_sub(overlap));
                        None
                    }
                };
            }

            match scan(&self.buf) {
                Scan::Frame { start, end } => return Some(self.take_frame(start, end)),
                Scan::Skip { end } => {
                    self.buf.drain(..end);
                }
                Scan::NeedMore { start } => {
                    self.buf.drain(..start);
                    return None;
                }
                Scan::Open {
                    start,
                    body,
                    closing,
                } => {
                    self.buf.drain(..start);
                    self.open = Some(OpenElement {
                        closing,
                        resume: body - start,
                    });
                }
            }
        }
    }

    fn take_frame(&mut self, start: usize, end: usize) -> String {
        let frame = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
        self.buf.drain(..end);
        frame
    }
}

fn scan(buf: &[u8]) -> Scan {
    let start = match buf.iter().position(|&b| b == b'<') {
        Some(pos) => pos,
        None => return Scan::NeedMore { start: buf.len() },
    };

    let rest = &buf[start..];

    // Comments and declarations end on their own terminators, not on tag balance
    if rest.starts_with(b"<!--") {
        return match find(rest, b"-->", 4) {
            Some(pos) => Scan::Skip { end: start + pos + 3 },
            None => Scan::NeedMore { start },
        };
    }
    if rest.starts_with(b"<?") {
        return match find(rest, b"?>", 2) {
            Some(pos) => Scan::Skip { end: start + pos + 2 },
            None => Scan::NeedMore { start },
        };
    }

    let tag_end = match find_tag_end(rest) {
        Some(pos) => pos,
        None => return Scan::NeedMore { start },
    };

    let tag_name = tag_name(&rest[1..tag_end]);
    if tag_name.is_empty() || tag_name.starts_with(b"/") || tag_name.starts_with(b"!") {
        // Stray closing tag or doctype
        return Scan::Skip { end: start + tag_end + 1 };
    }

    if is_self_closing(&rest[..tag_end]) {
        return Scan::Frame {
            start,
            end: start + tag_end + 1,
        };
    }

    let mut closing = Vec::with_capacity(tag_name.len() + 3);
    closing.extend_from_slice(b"</");
    closing.extend_from_slice(tag_name);
    closing.push(b'>');

    Scan::Open {
        start,
        body: start + tag_end + 1,
        closing,
    }
}

/// Index of the `>` closing the tag that opens `tag`, ignoring quoted attribute values
fn find_tag_end(tag: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in tag.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn tag_name(tag_body: &[u8]) -> &[u8] {
    let end = tag_body
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'>' || (b == b'/' && !tag_body.starts_with(b"/")))
        .unwrap_or(tag_body.len());
    &tag_body[..end]
}

fn is_self_closing(open_tag: &[u8]) -> bool {
    open_tag
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .map(|&b| b == b'/')
        .unwrap_or(false)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paired_element_split_across_reads() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<defTextVector device=\"Tel\" name=\"INFO\"><defText name=\"A\">x</defT");
        assert_eq!(frames.next_frame(), None);

        frames.push(b"ext></defTextVector>\n<delProperty device=\"Tel\"/>");
        assert_eq!(
            frames.next_frame().as_deref(),
            Some("<defTextVector device=\"Tel\" name=\"INFO\"><defText name=\"A\">x</defText></defTextVector>")
        );
        assert_eq!(frames.next_frame().as_deref(), Some("<delProperty device=\"Tel\"/>"));
        assert_eq!(frames.next_frame(), None);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_self_closing_with_attributes_is_complete() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<delProperty device=\"CCD Simulator\" name=\"CCD_TEMPERATURE\" />");
        assert_eq!(
            frames.next_frame().as_deref(),
            Some("<delProperty device=\"CCD Simulator\" name=\"CCD_TEMPERATURE\" />")
        );
    }

    #[test]
    fn test_gt_inside_attribute_does_not_end_tag() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<message device=\"x\" message=\"a > b\"/>");
        assert_eq!(
            frames.next_frame().as_deref(),
            Some("<message device=\"x\" message=\"a > b\"/>")
        );
    }

    #[test]
    fn test_incomplete_open_tag_waits() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<setNumberVector device=\"Foc");
        assert_eq!(frames.next_frame(), None);
        assert_eq!(frames.pending(), 28);
    }

    #[test]
    fn test_leading_noise_and_declarations_are_skipped() {
        let mut frames = FrameBuffer::new();
        frames.push(b"  \n<?xml version=\"1.0\"?><!-- hello --></stray><getProperties version=\"1.7\"/>");
        assert_eq!(
            frames.next_frame().as_deref(),
            Some("<getProperties version=\"1.7\"/>")
        );
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_closing_tag_must_match_name_exactly() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<message device=\"x\">hi</messages>");
        assert_eq!(frames.next_frame(), None);
        frames.push(b"</message>");
        assert_eq!(
            frames.next_frame().as_deref(),
            Some("<message device=\"x\">hi</messages></message>")
        );
    }

    #[test]
    fn test_closing_tag_split_at_every_offset() {
        let frame = "<setTextVector device=\"Tel\" name=\"INFO\"><oneText name=\"A\">x</oneText></setTextVector>";
        for chunk in 1..=frame.len() {
            let mut frames = FrameBuffer::new();
            let mut out = Vec::new();
            for piece in frame.as_bytes().chunks(chunk) {
                frames.push(piece);
                out.extend(std::iter::from_fn(|| frames.next_frame()));
            }
            assert_eq!(out, vec![frame.to_string()], "chunk size {}", chunk);
            assert_eq!(frames.pending(), 0);
        }
    }

    #[test]
    fn test_large_blob_frames_in_linear_time() {
        let payload = "A".repeat(8 * 1024 * 1024);
        let element = format!(
            "<setBLOBVector device=\"CCD Simulator\" name=\"CCD1\" state=\"Ok\">\
             <oneBLOB name=\"CCD1\" size=\"{}\" format=\".fits\">{}</oneBLOB></setBLOBVector>\
             <delProperty device=\"CCD Simulator\"/>",
            payload.len(),
            payload
        );

        let started = std::time::Instant::now();
        let mut frames = FrameBuffer::new();
        let mut out = Vec::new();
        for piece in element.as_bytes().chunks(16 * 1024) {
            frames.push(piece);
            out.extend(std::iter::from_fn(|| frames.next_frame()));
        }
        let elapsed = started.elapsed();

        assert_eq!(out.len(), 2);
        assert!(out[0].ends_with("</oneBLOB></setBLOBVector>"));
        assert_eq!(out[1], "<delProperty device=\"CCD Simulator\"/>");
        assert!(elapsed < std::time::Duration::from_secs(5), "framing took {:?}", elapsed);
    }

    #[test]
    fn test_clear_drops_partial_frame() {
        let mut frames = FrameBuffer::new();
        frames.push(b"<defSwitchVector device=\"x\">");
        assert_eq!(frames.next_frame(), None);
        frames.clear();
        assert_eq!(frames.pending(), 0);

        frames.push(b"<message device=\"y\"/>");
        assert_eq!(frames.next_frame().as_deref(), Some("<message device=\"y\"/>"));
    }
}
