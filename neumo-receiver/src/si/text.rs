//! DVB text decoding (EN 300 468 annex A).
//!
//! The first byte of a text field may select a character table. Without a
//! selector the default table (ISO/IEC 6937) is used. Control codes 0x80 to
//! 0x9F are removed, except the CR/LF code 0x8A which becomes a newline.

use encoding_rs::{Encoding, BIG5, EUC_KR, GBK, UTF_16BE};

/// Decode a DVB text field.
pub fn decode_dvb_string(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    let first = data[0];
    let text = match first {
        0x20..=0xFF => decode_iso6937(data),
        0x01..=0x0B => decode_iso8859(first as u32 + 4, &data[1..]),
        0x10 => {
            if data.len() < 3 {
                return String::new();
            }
            let part = ((data[1] as u32) << 8) | data[2] as u32;
            decode_iso8859(part, &data[3..])
        }
        0x11 => decode_with(UTF_16BE, &data[1..]),
        0x12 => decode_with(EUC_KR, &data[1..]),
        0x13 => decode_with(GBK, &data[1..]),
        0x14 => decode_with(BIG5, &data[1..]),
        0x15 => String::from_utf8_lossy(&data[1..]).into_owned(),
        // 0x1F: encoding_type_id follows, used for compressed (Freesat) text.
        0x1F => return String::new(),
        _ => decode_iso6937(&data[1..]),
    };
    strip_wide_controls(&text)
}

/// ISO-8859-1 fallback used for proprietary EPG texts.
pub fn decode_latin1(data: &[u8]) -> String {
    single_byte(data).into_iter().map(|b| b as char).collect()
}

fn decode_with(encoding: &'static Encoding, data: &[u8]) -> String {
    encoding.decode_without_bom_handling(data).0.into_owned()
}

fn decode_iso8859(part: u32, data: &[u8]) -> String {
    let bytes = single_byte(data);
    if part == 1 {
        return bytes.into_iter().map(|b| b as char).collect();
    }
    let label = format!("iso-8859-{}", part);
    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding.decode_without_bom_handling(&bytes).0.into_owned(),
        None => bytes.into_iter().map(|b| b as char).collect(),
    }
}

/// Remove single byte control codes, mapping CR/LF to '\n'.
fn single_byte(data: &[u8]) -> Vec<u8> {
    data.iter()
        .filter_map(|&b| match b {
            0x8A => Some(b'\n'),
            0x80..=0x9F => None,
            0x00..=0x09 | 0x0B..=0x1F => None,
            _ => Some(b),
        })
        .collect()
}

/// Control codes of multibyte tables live at U+E080..U+E09F.
fn strip_wide_controls(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c as u32 {
            0xE08A => Some('\n'),
            0xE080..=0xE09F => None,
            _ => Some(c),
        })
        .filter(|c| !c.is_control() || *c == '\n')
        .collect()
}

/// ISO/IEC 6937 with the non-spacing diacritical marks at 0xC1..0xCF.
fn decode_iso6937(data: &[u8]) -> String {
    let bytes = single_byte(data);
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0xC1..=0xCF if i + 1 < bytes.len() => {
                let base = bytes[i + 1] as char;
                out.push(compose(b, base).unwrap_or(base));
                i += 2;
                continue;
            }
            0xA4 => out.push('$'),
            0xA6 => out.push('#'),
            0xA8 => out.push('¤'),
            0xA9 => out.push('‘'),
            0xAA => out.push('“'),
            0xAC => out.push('←'),
            0xAD => out.push('↑'),
            0xAE => out.push('→'),
            0xAF => out.push('↓'),
            0xB4 => out.push('×'),
            0xB8 => out.push('÷'),
            0xB9 => out.push('’'),
            0xBA => out.push('”'),
            0xD0 => out.push('―'),
            0xD4 => out.push('™'),
            0xD5 => out.push('♪'),
            0xE0 => out.push('Ω'),
            0xE1 => out.push('Æ'),
            0xE9 => out.push('Ø'),
            0xEA => out.push('Œ'),
            0xF1 => out.push('æ'),
            0xF9 => out.push('ø'),
            0xFA => out.push('œ'),
            0xFB => out.push('ß'),
            _ => out.push(b as char),
        }
        i += 1;
    }
    out
}

fn compose(diacritic: u8, base: char) -> Option<char> {
    let (from, to) = match diacritic {
        0xC1 => ("AEIOUaeiou", "ÀÈÌÒÙàèìòù"),
        0xC2 => ("AEIOUYaeiouyCcNnSsZz", "ÁÉÍÓÚÝáéíóúýĆćŃńŚśŹź"),
        0xC3 => ("AEIOUaeiou", "ÂÊÎÔÛâêîôû"),
        0xC4 => ("ANOano", "ÃÑÕãñõ"),
        0xC8 => ("AEIOUaeiouy", "ÄËÏÖÜäëïöüÿ"),
        0xCA => ("AaUu", "ÅåŮů"),
        0xCB => ("CcSsTt", "ÇçŞşŢţ"),
        0xCF => ("CcSsZzRrEeNnDdTt", "ČčŠšŽžŘřĚěŇňĎďŤť"),
        _ => return None,
    };
    let pos = from.chars().position(|c| c == base)?;
    to.chars().nth(pos)
}
