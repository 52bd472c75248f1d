//! EIT parsing for DVB (also used by Freesat and Viasat), Sky OpenTV and
//! MediaHighway 2 guide data.

use super::descriptors::{descriptors, parse_content, parse_extended_event_text, ShortEvent};
use super::psi::PsiSection;
use super::text::decode_latin1;
use super::{descriptor_tag, table_id};

/// One programme of a DVB EIT section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EitEvent {
    pub event_id: u16,
    /// Unix time, 0 when undefined.
    pub start_time: i64,
    /// Seconds.
    pub duration: u32,
    pub running_status: u8,
    pub free_ca_mode: bool,
    pub event_name: String,
    pub story: String,
    pub content_codes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EitSection {
    pub table_id: u8,
    pub service_id: u16,
    pub ts_id: u16,
    pub original_network_id: u16,
    pub segment_last_section_number: u8,
    pub last_table_id: u8,
    pub events: Vec<EitEvent>,
}

impl EitSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if !table_id::is_dvb_eit(section.header.table_id) {
            return Err("Not an EIT section");
        }
        let data = section.data;
        if data.len() < 6 {
            return Err("EIT data too short");
        }
        let mut eit = EitSection {
            table_id: section.header.table_id,
            service_id: section.header.table_id_extension,
            ts_id: u16::from_be_bytes([data[0], data[1]]),
            original_network_id: u16::from_be_bytes([data[2], data[3]]),
            segment_last_section_number: data[4],
            last_table_id: data[5],
            events: Vec::new(),
        };

        let mut offset = 6;
        while offset + 12 <= data.len() {
            let event_id = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let start_time = mjd_bcd_to_unix(&data[offset + 2..offset + 7]);
            let duration = bcd_duration(&data[offset + 7..offset + 10]);
            let running_status = data[offset + 10] >> 5;
            let free_ca_mode = data[offset + 10] & 0x10 != 0;
            let len = ((data[offset + 10] as usize & 0x0F) << 8) | data[offset + 11] as usize;
            offset += 12;
            if offset + len > data.len() {
                return Err("Invalid event descriptors length");
            }

            let mut event = EitEvent {
                event_id,
                start_time,
                duration,
                running_status,
                free_ca_mode,
                ..Default::default()
            };
            for (tag, payload) in descriptors(&data[offset..offset + len]) {
                match tag {
                    descriptor_tag::SHORT_EVENT => {
                        if let Ok(s) = ShortEvent::parse(payload) {
                            event.event_name = s.event_name;
                            if !s.text.is_empty() {
                                event.story = s.text;
                            }
                        }
                    }
                    descriptor_tag::EXTENDED_EVENT => {
                        if let Ok(text) = parse_extended_event_text(payload) {
                            if !event.story.is_empty() && !text.is_empty() {
                                event.story.push(' ');
                            }
                            event.story.push_str(&text);
                        }
                    }
                    descriptor_tag::CONTENT => event.content_codes.extend(parse_content(payload)),
                    _ => {}
                }
            }
            offset += len;
            eit.events.push(event);
        }
        Ok(eit)
    }
}

/// Convert a 16 bit MJD followed by a 24 bit BCD UTC time to unix time.
pub fn mjd_bcd_to_unix(data: &[u8]) -> i64 {
    if data.len() < 5 || data.iter().all(|&b| b == 0xFF) {
        return 0;
    }
    let mjd = u16::from_be_bytes([data[0], data[1]]) as i64;
    let secs = bcd_duration(&data[2..5]) as i64;
    (mjd - 40587) * 86_400 + secs
}

/// 24 bit BCD `hhmmss` to seconds.
pub fn bcd_duration(data: &[u8]) -> u32 {
    let bcd = |b: u8| ((b >> 4) * 10 + (b & 0x0F)) as u32;
    bcd(data[0]) * 3600 + bcd(data[1]) * 60 + bcd(data[2])
}

/// Sky OpenTV title.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyTitle {
    pub event_id: u16,
    pub start_time: i64,
    pub duration: u32,
    pub theme: u8,
    pub title: String,
}

/// Sky OpenTV title section (table ids 0xA0 to 0xA3).
#[derive(Debug, Clone, PartialEq)]
pub struct SkyTitleSection {
    pub channel_id: u16,
    pub titles: Vec<SkyTitle>,
}

/// Sky OpenTV summary section (table ids 0xA8 to 0xAB).
#[derive(Debug, Clone, PartialEq)]
pub struct SkySummarySection {
    pub channel_id: u16,
    /// `(event_id, summary)`.
    pub summaries: Vec<(u16, String)>,
}

const SKY_TITLE_TAG: u8 = 0xB5;
const SKY_SUMMARY_TAG: u8 = 0xB9;

/// Walk the `event_id, length, descriptors` records that follow the base MJD.
fn sky_records(data: &[u8]) -> Result<(i64, Vec<(u16, &[u8])>), &'static str> {
    if data.len() < 2 {
        return Err("Sky section too short");
    }
    let mjd = u16::from_be_bytes([data[0], data[1]]) as i64;
    let base = (mjd - 40587) * 86_400;
    let mut out = Vec::new();
    let mut offset = 2;
    while offset + 4 <= data.len() {
        let event_id = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = ((data[offset + 2] as usize & 0x0F) << 8) | data[offset + 3] as usize;
        offset += 4;
        if offset + len > data.len() {
            return Err("Invalid Sky record length");
        }
        out.push((event_id, &data[offset..offset + len]));
        offset += len;
    }
    Ok((base, out))
}

impl SkyTitleSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        let tid = section.header.table_id;
        if !(table_id::SKY_TITLES_FIRST..=table_id::SKY_TITLES_LAST).contains(&tid) {
            return Err("Not a Sky title section");
        }
        let (base, records) = sky_records(section.data)?;
        let mut titles = Vec::new();
        for (event_id, descs) in records {
            for (tag, d) in descriptors(descs) {
                if tag != SKY_TITLE_TAG || d.len() < 6 {
                    continue;
                }
                // times in units of two seconds
                let start = u16::from_be_bytes([d[0], d[1]]) as i64 * 2;
                let duration = u16::from_be_bytes([d[2], d[3]]) as u32 * 2;
                titles.push(SkyTitle {
                    event_id,
                    start_time: base + start,
                    duration,
                    theme: d[4],
                    // TODO: Huffman-decode titles with the Sky UK/IT tables.
                    title: decode_latin1(&d[6..]),
                });
            }
        }
        Ok(SkyTitleSection {
            channel_id: section.header.table_id_extension,
            titles,
        })
    }
}

impl SkySummarySection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        let tid = section.header.table_id;
        if !(table_id::SKY_SUMMARIES_FIRST..=table_id::SKY_SUMMARIES_LAST).contains(&tid) {
            return Err("Not a Sky summary section");
        }
        let (_, records) = sky_records(section.data)?;
        let mut summaries = Vec::new();
        for (event_id, descs) in records {
            for (tag, d) in descriptors(descs) {
                if tag == SKY_SUMMARY_TAG {
                    summaries.push((event_id, decode_latin1(d)));
                }
            }
        }
        Ok(SkySummarySection {
            channel_id: section.header.table_id_extension,
            summaries,
        })
    }
}

/// MediaHighway 2 title.
#[derive(Debug, Clone, PartialEq)]
pub struct Mhw2Title {
    pub service_id: u16,
    pub event_id: u32,
    pub start_time: i64,
    pub duration: u32,
    pub title: String,
}

/// MediaHighway 2 title section (table id 0xE6).
///
/// Records: service id (16), event id (32), MJD + BCD start (40),
/// duration in minutes (16), title length (8), title.
#[derive(Debug, Clone, PartialEq)]
pub struct Mhw2TitleSection {
    pub titles: Vec<Mhw2Title>,
}

/// MediaHighway 2 summary section (table id 0x96).
///
/// Records: event id (32), text length (16), text.
#[derive(Debug, Clone, PartialEq)]
pub struct Mhw2SummarySection {
    pub summaries: Vec<(u32, String)>,
}

impl Mhw2TitleSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::MHW2_TITLES {
            return Err("Not a MHW2 title section");
        }
        let data = section.data;
        let mut titles = Vec::new();
        let mut offset = 0;
        while offset + 14 <= data.len() {
            let r = &data[offset..];
            let len = r[13] as usize;
            if 14 + len > r.len() {
                return Err("Invalid MHW2 title length");
            }
            titles.push(Mhw2Title {
                service_id: u16::from_be_bytes([r[0], r[1]]),
                event_id: u32::from_be_bytes([r[2], r[3], r[4], r[5]]),
                start_time: mjd_bcd_to_unix(&r[6..11]),
                duration: u16::from_be_bytes([r[11], r[12]]) as u32 * 60,
                title: decode_latin1(&r[14..14 + len]),
            });
            offset += 14 + len;
        }
        Ok(Mhw2TitleSection { titles })
    }
}

impl Mhw2SummarySection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::MHW2_SUMMARIES {
            return Err("Not a MHW2 summary section");
        }
        let data = section.data;
        let mut summaries = Vec::new();
        let mut offset = 0;
        while offset + 6 <= data.len() {
            let r = &data[offset..];
            let len = u16::from_be_bytes([r[4], r[5]]) as usize;
            if 6 + len > r.len() {
                return Err("Invalid MHW2 summary length");
            }
            summaries.push((
                u32::from_be_bytes([r[0], r[1], r[2], r[3]]),
                decode_latin1(&r[6..6 + len]),
            ));
            offset += 6 + len;
        }
        Ok(Mhw2SummarySection { summaries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::psi::SectionBuilder;

    #[test]
    fn test_mjd_bcd_to_unix() {
        // 1993-10-13 12:45:00 UTC (EN 300 468 annex C example)
        assert_eq!(mjd_bcd_to_unix(&[0xC0, 0x79, 0x12, 0x45, 0x00]), 750_516_300);
        assert_eq!(mjd_bcd_to_unix(&[0xFF; 5]), 0);
        assert_eq!(bcd_duration(&[0x01, 0x30, 0x00]), 5400);
    }

    #[test]
    fn test_parse_dvb_eit() {
        let body = [
            0x04, 0x1B, 0x00, 0x01, 0x00, 0x50, // ts_id, onid, segment last, last table
            0x12, 0x34, 0xC0, 0x79, 0x12, 0x45, 0x00, 0x01, 0x30, 0x00, // event header
            0x80, 0x0E, // running, 14 bytes of descriptors
            0x4D, 0x0C, b'e', b'n', b'g', 0x04, b'N', b'e', b'w', b's', 0x03, b'a', b'b', b'c',
        ];
        let raw = SectionBuilder::new(0x50, 0x6FF, 2).build(&body);
        let eit = EitSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert_eq!(eit.service_id, 0x6FF);
        assert_eq!(eit.ts_id, 1051);
        let ev = &eit.events[0];
        assert_eq!(ev.event_id, 0x1234);
        assert_eq!(ev.start_time, 750_516_300);
        assert_eq!(ev.duration, 5400);
        assert_eq!(ev.running_status, 4);
        assert_eq!(ev.event_name, "News");
        assert_eq!(ev.story, "abc");
    }

    #[test]
    fn test_sky_title_and_summary() {
        let titles = [
            0xC0, 0x79, // base MJD
            0x00, 0x10, 0xF0, 0x0A, // event 16, 10 bytes
            0xB5, 0x08, 0x00, 0x0A, 0x07, 0x08, 0x21, 0x00, b'H', b'i',
        ];
        let raw = SectionBuilder::new(0xA0, 4101, 0).build(&titles);
        let t = SkyTitleSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert_eq!(t.channel_id, 4101);
        assert_eq!(t.titles[0].event_id, 16);
        assert_eq!(t.titles[0].start_time, 750_470_400 + 20);
        assert_eq!(t.titles[0].duration, 0x0708 * 2);
        assert_eq!(t.titles[0].title, "Hi");

        let summaries = [0xC0, 0x79, 0x00, 0x10, 0xF0, 0x05, 0xB9, 0x03, b'a', b'b', b'c'];
        let raw = SectionBuilder::new(0xA8, 4101, 0).build(&summaries);
        let s = SkySummarySection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert_eq!(s.summaries, vec![(16, "abc".to_string())]);
    }

    #[test]
    fn test_mhw2_title_and_summary() {
        let titles = [
            0x00, 0x07, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x79, 0x12, 0x45, 0x00, 0x00, 0x5A, 0x02,
            b'O', b'K',
        ];
        let raw = SectionBuilder::new(table_id::MHW2_TITLES, 0, 0).build(&titles);
        let t = Mhw2TitleSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert_eq!(t.titles[0].service_id, 7);
        assert_eq!(t.titles[0].event_id, 256);
        assert_eq!(t.titles[0].duration, 90 * 60);
        assert_eq!(t.titles[0].title, "OK");

        let summaries = [0x00, 0x00, 0x01, 0x00, 0x00, 0x02, b'o', b'k'];
        let raw = SectionBuilder::new(table_id::MHW2_SUMMARIES, 0, 0).build(&summaries);
        let s = Mhw2SummarySection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert_eq!(s.summaries, vec![(256, "ok".to_string())]);
    }
}
