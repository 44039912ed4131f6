//! Minimal ISO-BMFF (`.mov` / `.mp4`) probing
//!
//! Only walks far enough to find the display size of the first video
//! track: `moov/trak/tkhd` dimensions with the track matrix applied.

/// Display dimensions of the first video track, `None` if the file has no
/// parseable video track.
pub fn probe_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let moov = find_box(data, b"moov")?;
    for trak in boxes(moov).filter(|b| &b.kind == b"trak") {
        if !is_video_track(trak.body) {
            continue;
        }
        let tkhd = find_box(trak.body, b"tkhd")?;
        return parse_tkhd(tkhd);
    }
    None
}

struct BoxRef<'a> {
    kind: [u8; 4],
    body: &'a [u8],
}

struct Boxes<'a> {
    data: &'a [u8],
    pos: usize,
}

fn boxes(data: &[u8]) -> Boxes<'_> {
    Boxes { data, pos: 0 }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = BoxRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        if rest.len() < 8 {
            return None;
        }
        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as u64;
        let kind = [rest[4], rest[5], rest[6], rest[7]];

        let (header, size) = match size32 {
            // Box extends to the end of its container
            0 => (8usize, rest.len() as u64),
            // 64-bit largesize follows the type
            1 => {
                let large = rest.get(8..16)?;
                (16, u64::from_be_bytes(large.try_into().ok()?))
            }
            n => (8, n),
        };

        if size < header as u64 || size > rest.len() as u64 {
            return None;
        }
        let size = size as usize;
        self.pos += size;
        Some(BoxRef {
            kind,
            body: &rest[header..size],
        })
    }
}

fn find_box<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(data).find(|b| &b.kind == kind).map(|b| b.body)
}

/// `trak/mdia/hdlr` handler type is `vide`
fn is_video_track(trak: &[u8]) -> bool {
    let Some(mdia) = find_box(trak, b"mdia") else {
        return false;
    };
    let Some(hdlr) = find_box(mdia, b"hdlr") else {
        return false;
    };
    // version/flags (4), pre_defined (4), handler_type (4)
    hdlr.get(8..12) == Some(b"vide".as_slice())
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    read_u32(data, at).map(|v| v as i32)
}

fn parse_tkhd(tkhd: &[u8]) -> Option<(u32, u32)> {
    let version = *tkhd.first()?;
    // Offset of the matrix after version/flags and the time fields
    let matrix_at = match version {
        0 => 4 + 20 + 16,
        1 => 4 + 32 + 16,
        _ => return None,
    };

    // a b u / c d v / x y w; a..d are 16.16 fixed point
    let fixed = |i: usize| read_i32(tkhd, matrix_at + i * 4).map(|v| v as f64 / 65536.0);
    let (a, b, c, d) = (fixed(0)?, fixed(1)?, fixed(3)?, fixed(4)?);

    let width = read_u32(tkhd, matrix_at + 36)? as f64 / 65536.0;
    let height = read_u32(tkhd, matrix_at + 40)? as f64 / 65536.0;

    let display_w = (a * width + c * height).abs();
    let display_h = (b * width + d * height).abs();
    Some((display_w.round() as u32, display_h.round() as u32))
}
