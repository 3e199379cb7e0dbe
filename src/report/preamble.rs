use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Device identity extracted from the bugreport header preamble and the
/// battery service dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub api_level: Option<u32>,
    pub build_id: Option<String>,
    pub fingerprint: Option<String>,
    pub uptime_ms: Option<u64>,
    pub report_time: Option<String>,
    pub battery: Option<BatteryInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    pub level: i32,
    pub temp_c: f32,
    pub status: String,
}

/// BatteryManager status codes as dumped by the battery service.
fn battery_status_name(code: i32) -> String {
    match code {
        2 => "charging".to_string(),
        3 => "discharging".to_string(),
        4 => "not charging".to_string(),
        5 => "full".to_string(),
        _ => "unknown".to_string(),
    }
}

/// Incremental scanner fed every non-logcat line of the report. Fields
/// are first-writer-wins: bugreports repeat the property dump and the
/// first occurrence is the header preamble.
pub struct DeviceScanner {
    prop_re: Regex,
    dumpstate_re: Regex,
    device: DeviceInfo,
    timezone: Option<String>,
    report_time: Option<NaiveDateTime>,
    battery_level: Option<i32>,
    battery_temp: Option<i32>,
    battery_status: Option<i32>,
    in_battery_dump: bool,
}

impl DeviceScanner {
    pub fn new() -> Self {
        Self {
            prop_re: Regex::new(r"^\[([A-Za-z0-9._-]+)\]: \[(.*)\]$").expect("prop pattern"),
            dumpstate_re: Regex::new(r"^={0,2}\s*dumpstate: (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})")
                .expect("dumpstate pattern"),
            device: DeviceInfo::default(),
            timezone: None,
            report_time: None,
            battery_level: None,
            battery_temp: None,
            battery_status: None,
            in_battery_dump: false,
        }
    }

    pub fn observe(&mut self, line: &str) {
        let trimmed = line.trim_end();

        if let Some(caps) = self.prop_re.captures(trimmed) {
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            self.observe_prop(key, value);
            return;
        }

        if self.report_time.is_none() {
            if let Some(caps) = self.dumpstate_re.captures(trimmed) {
                let raw = &caps[1];
                if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
                    self.report_time = Some(parsed);
                    self.device.report_time = Some(parsed.format("%Y-%m-%dT%H:%M:%S").to_string());
                }
                return;
            }
        }

        if self.device.fingerprint.is_none() {
            if let Some(rest) = trimmed.strip_prefix("Build fingerprint:") {
                self.device.fingerprint = clean_value(rest);
                return;
            }
        }
        if self.device.build_id.is_none() {
            if let Some(rest) = trimmed.strip_prefix("Build:") {
                self.device.build_id = clean_value(rest);
                return;
            }
        }
        if self.device.uptime_ms.is_none() {
            if let Some(rest) = trimmed.strip_prefix("Uptime:") {
                self.device.uptime_ms = parse_uptime_ms(rest);
                return;
            }
        }

        self.observe_battery(trimmed);
    }

    fn observe_prop(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        match key {
            "ro.product.brand" | "ro.product.system.brand" => {
                self.device.brand.get_or_insert_with(|| value.to_string());
            }
            "ro.product.model" | "ro.product.system.model" => {
                self.device.model.get_or_insert_with(|| value.to_string());
            }
            "ro.build.version.release" => {
                self.device
                    .android_version
                    .get_or_insert_with(|| value.to_string());
            }
            "ro.build.version.sdk" => {
                if self.device.api_level.is_none() {
                    self.device.api_level = value.parse().ok();
                }
            }
            "ro.build.id" => {
                // Prefer the property over the free-form "Build:" line.
                self.device.build_id = Some(value.to_string());
            }
            "ro.build.fingerprint" => {
                self.device
                    .fingerprint
                    .get_or_insert_with(|| value.to_string());
            }
            "persist.sys.timezone" => {
                self.timezone.get_or_insert_with(|| value.to_string());
            }
            _ => {}
        }
    }

    fn observe_battery(&mut self, trimmed: &str) {
        if trimmed.contains("DUMP OF SERVICE battery") {
            self.in_battery_dump = true;
            return;
        }
        if !self.in_battery_dump {
            return;
        }
        if trimmed.contains("DUMP OF SERVICE") || trimmed.starts_with("------") {
            self.in_battery_dump = false;
            return;
        }

        let inner = trimmed.trim_start();
        if let Some(rest) = inner.strip_prefix("level:") {
            if self.battery_level.is_none() {
                self.battery_level = rest.trim().parse().ok();
            }
        } else if let Some(rest) = inner.strip_prefix("temperature:") {
            if self.battery_temp.is_none() {
                self.battery_temp = rest.trim().parse().ok();
            }
        } else if let Some(rest) = inner.strip_prefix("status:") {
            if self.battery_status.is_none() {
                self.battery_status = rest.trim().parse().ok();
            }
        }
    }

    /// Report wall-clock time from the dumpstate header, used to seed the
    /// logcat year.
    pub fn report_time(&self) -> Option<NaiveDateTime> {
        self.report_time
    }

    /// `persist.sys.timezone` if the property dump carried it.
    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn finish(mut self) -> DeviceInfo {
        if let Some(level) = self.battery_level {
            self.device.battery = Some(BatteryInfo {
                level,
                temp_c: self.battery_temp.map(|t| t as f32 / 10.0).unwrap_or(0.0),
                status: battery_status_name(self.battery_status.unwrap_or(1)),
            });
        }
        self.device
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_value(rest: &str) -> Option<String> {
    let value = rest.trim().trim_matches('\'');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parses the human-readable `Uptime: up 2 weeks, 1 day, 3 hours, 25 minutes`
/// line into milliseconds.
fn parse_uptime_ms(rest: &str) -> Option<u64> {
    let mut total_secs: u64 = 0;
    let mut matched = false;
    for part in rest.trim().trim_start_matches("up ").split(',') {
        let part = part.trim();
        let mut words = part.split_whitespace();
        let (Some(amount), Some(unit)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(amount) = amount.parse::<u64>() else {
            continue;
        };
        let secs = match unit.trim_end_matches('s') {
            "week" => amount * 7 * 24 * 3600,
            "day" => amount * 24 * 3600,
            "hour" => amount * 3600,
            "minute" => amount * 60,
            "second" => amount,
            _ => continue,
        };
        total_secs += secs;
        matched = true;
    }
    if matched {
        Some(total_secs * 1000)
    } else {
        None
    }
}
