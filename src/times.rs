use crate::access::{le_u32, put_u32};
use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

/// 1980-01-01T00:00:00Z, the earliest instant the packed format can hold.
pub const DOS_EPOCH: i64 = 315_532_800;

/// One decoded timestamp: an absolute UTC instant plus the 15-minute
/// timezone offset it was recorded in (`None` when the on-disk offset
/// was marked invalid, which the format treats as UTC).
///
/// The packed form stores local wall-clock time at 2-second granularity
/// plus a 10 ms tick count that carries the odd second and the
/// sub-second part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTime {
    pub unix_secs: i64,
    pub centis: u8,
    pub tz_offset_quarters: Option<i8>,
}

impl EntryTime {
    /// Decodes a packed date/time word plus its tick and timezone bytes.
    /// Implausible field values fall back to the DOS epoch with a warning
    /// rather than failing the whole entry.
    pub fn from_dos(stamp: u32, ticks: u8, tz_byte: u8) -> Self {
        let date = (stamp >> 16) as u16;
        let time = (stamp & 0xFFFF) as u16;
        let year = 1980 + i32::from((date >> 9) & 0x7F);
        let month = u32::from((date >> 5) & 0x0F);
        let day = u32::from(date & 0x1F);
        let hour = u32::from((time >> 11) & 0x1F);
        let minute = u32::from((time >> 5) & 0x3F);
        let second = u32::from(time & 0x1F) * 2;

        let local = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_else(|| {
                warn!("invalid packed timestamp {:#010x}", stamp);
                DOS_EPOCH
            });

        let ticks = if ticks > 199 {
            warn!("10ms tick count {} out of range", ticks);
            199
        } else {
            ticks
        };

        let tz = if tz_byte & 0x80 != 0 {
            // Low 7 bits are a signed count of 15-minute units.
            Some(((tz_byte << 1) as i8) >> 1)
        } else {
            None
        };

        let mut secs = local + i64::from(ticks / 100);
        if let Some(q) = tz {
            secs -= i64::from(q) * 900;
        }
        Self {
            unix_secs: secs,
            centis: ticks % 100,
            tz_offset_quarters: tz,
        }
    }

    /// Inverse of `from_dos`: `(packed word, ticks, tz byte)`. Years are
    /// clamped to the representable 1980..=2107 range.
    pub fn to_dos(&self) -> (u32, u8, u8) {
        let q = self.tz_offset_quarters.unwrap_or(0);
        let local = self.unix_secs + i64::from(q) * 900;
        let naive = DateTime::from_timestamp(local, 0).map(|dt| dt.naive_utc());
        let (year, month, day, hour, minute, second) = match naive {
            Some(n) if n.year() < 1980 => (1980, 1, 1, 0, 0, 0),
            Some(n) if n.year() > 2107 => (2107, 12, 31, 23, 59, 58),
            Some(n) => (
                n.year(),
                n.month(),
                n.day(),
                n.hour(),
                n.minute(),
                n.second(),
            ),
            None if local < 0 => (1980, 1, 1, 0, 0, 0),
            None => (2107, 12, 31, 23, 59, 58),
        };
        let date = (((year - 1980) as u32) << 9) | (month << 5) | day;
        let time = (hour << 11) | (minute << 5) | (second / 2);
        let stamp = (date << 16) | time;
        let ticks = ((second % 2) * 100) as u8 + self.centis;
        let tz_byte = match self.tz_offset_quarters {
            Some(q) => 0x80 | ((q as u8) & 0x7F),
            None => 0,
        };
        (stamp, ticks, tz_byte)
    }

    /// Current instant in the local timezone, for freshly created entries.
    pub fn now() -> Self {
        let now = Local::now();
        let q = (now.offset().local_minus_utc() / 900).clamp(-64, 63) as i8;
        Self {
            unix_secs: now.timestamp(),
            centis: (now.timestamp_subsec_millis() / 10).min(99) as u8,
            tz_offset_quarters: Some(q),
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.unix_secs, u32::from(self.centis) * 10_000_000)
    }
}

/// The three timestamps of a file directory entry. Created and modified
/// carry 10 ms ticks; accessed is stored at 2-second granularity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTimes {
    pub created: EntryTime,
    pub modified: EntryTime,
    pub accessed: EntryTime,
}

impl EntryTimes {
    /// Decodes the timestamp fields of a 32-byte file directory entry.
    pub fn read(b: &[u8]) -> Self {
        Self {
            created: EntryTime::from_dos(le_u32(b, 8), b[20], b[22]),
            modified: EntryTime::from_dos(le_u32(b, 12), b[21], b[23]),
            accessed: EntryTime::from_dos(le_u32(b, 16), 0, b[24]),
        }
    }

    /// Encodes into the timestamp fields of a 32-byte file directory
    /// entry. The accessed stamp keeps no ticks, so its odd second and
    /// sub-second part round down.
    pub fn write(&self, b: &mut [u8]) {
        let (stamp, ticks, tz) = self.created.to_dos();
        put_u32(b, 8, stamp);
        b[20] = ticks;
        b[22] = tz;
        let (stamp, ticks, tz) = self.modified.to_dos();
        put_u32(b, 12, stamp);
        b[21] = ticks;
        b[23] = tz;
        let (stamp, _ticks, tz) = self.accessed.to_dos();
        put_u32(b, 16, stamp);
        b[24] = tz;
    }

    pub fn now() -> Self {
        let t = EntryTime::now();
        Self {
            created: t,
            modified: t,
            accessed: t,
        }
    }
}
