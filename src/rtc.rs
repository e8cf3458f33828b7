// Battery-backed RTC slave (DS1307-style). START materialises the current
// host time, shifted by a stored offset, into eight BCD registers. Writing
// sets the register pointer first, then the registers; when a STOP follows
// a write of any time register, the new offset against host time is stored.

use crate::i2c::I2cDevice;
use chrono::{Datelike, Duration, Local, TimeZone, Timelike};

pub const RTC_ADDR: u8 = 0x68;

const REG_SEC: usize = 0;
const REG_MIN: usize = 1;
const REG_HOUR: usize = 2;
const REG_DAY: usize = 3;
const REG_DATE: usize = 4;
const REG_MONTH: usize = 5;
const REG_YEAR: usize = 6;
const REG_CTRL: usize = 7;
const REG_COUNT: usize = 8;

fn dec_to_bcd(val: u32) -> u8 {
    (((val / 10) << 4) | (val % 10)) as u8
}

fn bcd_to_bin(bcd: u8) -> u32 {
    ((bcd >> 4) as u32) * 10 + (bcd & 0x0f) as u32
}

pub struct Rtc {
    ram: [u8; REG_COUNT],
    reg: usize,
    count: usize,
    changed: bool,
    /// Seconds between the programmed time and the host clock.
    time_diff: i64,
}

impl Rtc {
    pub fn new() -> Rtc {
        Rtc { ram: [0; REG_COUNT], reg: 0, count: 0, changed: false, time_diff: 0 }
    }

    fn materialise_time(&mut self) {
        let now = Local::now() + Duration::seconds(self.time_diff);
        self.ram[REG_SEC] = dec_to_bcd(now.second());
        self.ram[REG_MIN] = dec_to_bcd(now.minute());
        self.ram[REG_HOUR] = dec_to_bcd(now.hour());
        // Day of week is 1-7 on this part
        self.ram[REG_DAY] = dec_to_bcd(now.weekday().num_days_from_sunday() + 1);
        self.ram[REG_DATE] = dec_to_bcd(now.day());
        self.ram[REG_MONTH] = dec_to_bcd(now.month());
        self.ram[REG_YEAR] = dec_to_bcd(now.year() as u32 % 100);
    }

    /// Interpret the register array as a timestamp (seconds register masks
    /// out the clock-halt bit, hours assume 24-hour mode).
    fn registers_to_timestamp(&self) -> Option<i64> {
        let year = 2000 + bcd_to_bin(self.ram[REG_YEAR]) as i32;
        let month = bcd_to_bin(self.ram[REG_MONTH] & 0x1f);
        let day = bcd_to_bin(self.ram[REG_DATE] & 0x3f);
        let hour = bcd_to_bin(self.ram[REG_HOUR] & 0x3f);
        let min = bcd_to_bin(self.ram[REG_MIN] & 0x7f);
        let sec = bcd_to_bin(self.ram[REG_SEC] & 0x7f);
        Local
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(|dt| dt.timestamp())
    }
}

impl I2cDevice for Rtc {
    fn address(&self) -> u8 {
        RTC_ADDR
    }

    fn start(&mut self) {
        self.count = 0;
        self.changed = false;
        self.materialise_time();
    }

    fn read(&mut self) -> u8 {
        let data = self.ram[self.reg];
        self.reg = (self.reg + 1) % REG_COUNT;
        data
    }

    fn write(&mut self, data: u8) {
        if self.count == 0 {
            self.reg = (data as usize) % REG_COUNT;
        } else {
            if self.reg <= REG_YEAR {
                self.changed = true;
            }
            self.ram[self.reg] = data;
            self.reg = (self.reg + 1) % REG_COUNT;
        }
        self.count += 1;
    }

    fn stop(&mut self) {
        self.reg = 0;
        if self.changed {
            if let Some(base) = self.registers_to_timestamp() {
                self.time_diff = base - Local::now().timestamp();
            }
            self.changed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fills_bcd_registers() {
        let mut rtc = Rtc::new();
        rtc.start();
        for reg in 0..7 {
            let v = rtc.ram[reg];
            assert!(v >> 4 <= 9 && v & 0xf <= 9, "register {} is not BCD: {:02x}", reg, v);
        }
    }

    #[test]
    fn programming_time_stores_offset() {
        let mut rtc = Rtc::new();
        // Write pointer 0, then an arbitrary valid date in 2030
        rtc.start();
        for byte in [0x00, 0x30, 0x15, 0x10, 0x02, 0x01, 0x06, 0x30] {
            rtc.write(byte);
        }
        rtc.stop();
        assert_ne!(rtc.time_diff, 0);

        // A fresh START must materialise the shifted year
        rtc.start();
        assert_eq!(rtc.ram[REG_YEAR], 0x30);
    }
}
