use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Opening window for one weekday. Appointment slots are hourly starts
/// inside the window; a slot must fit entirely before closing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayHours {
    pub day: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCenter {
    pub id: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub hours: Vec<DayHours>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityEntry {
    pub name: String,
    pub centers: Vec<ServiceCenter>,
}

/// Static reference data: supported cities, their service centers, and
/// opening hours. Loaded once at startup and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub cities: Vec<CityEntry>,
}

impl Catalog {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let catalog: Catalog = serde_json::from_str(s)?;
        anyhow::ensure!(!catalog.cities.is_empty(), "catalog has no cities");
        for city in &catalog.cities {
            anyhow::ensure!(
                !city.centers.is_empty(),
                "city {} has no service centers",
                city.name
            );
            for center in &city.centers {
                for window in &center.hours {
                    parse_weekday(&window.day)?;
                    parse_time(&window.start)?;
                    parse_time(&window.end)?;
                }
            }
        }
        Ok(catalog)
    }

    pub fn city_names(&self) -> Vec<&str> {
        self.cities.iter().map(|c| c.name.as_str()).collect()
    }

    /// Exact (case-insensitive) city lookup.
    pub fn city(&self, name: &str) -> Option<&CityEntry> {
        self.cities
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Fuzzy city match against free text: exact name first, then the city
    /// name appearing anywhere in the text ("I'm in jeddah right now").
    pub fn resolve_city(&self, text: &str) -> Option<&CityEntry> {
        let text_lower = text.trim().to_lowercase();
        if text_lower.is_empty() {
            return None;
        }
        if let Some(city) = self.city(text_lower.trim()) {
            return Some(city);
        }
        self.cities
            .iter()
            .find(|c| text_lower.contains(&c.name.to_lowercase()))
    }

    pub fn center(&self, center_id: &str) -> Option<&ServiceCenter> {
        self.cities
            .iter()
            .flat_map(|c| c.centers.iter())
            .find(|center| center.id == center_id)
    }

    pub fn city_of_center(&self, center_id: &str) -> Option<&CityEntry> {
        self.cities
            .iter()
            .find(|c| c.centers.iter().any(|center| center.id == center_id))
    }

    /// Resolve a free-text center hint within a city. Ordinal references
    /// ("the first one", "2nd") resolve against the order the centers were
    /// last presented to the user, not against catalog order.
    pub fn resolve_center<'a>(
        &'a self,
        city: &'a CityEntry,
        hint: &str,
        presented: &[String],
    ) -> Option<&'a ServiceCenter> {
        let hint_lower = hint.trim().to_lowercase();
        if hint_lower.is_empty() {
            return None;
        }

        if let Some(idx) = ordinal_index(&hint_lower) {
            if let Some(id) = presented.get(idx) {
                return city.centers.iter().find(|c| &c.id == id);
            }
            return None;
        }

        if let Some(center) = city.centers.iter().find(|c| c.id == hint_lower) {
            return Some(center);
        }

        // Descriptive match: any distinctive word of the center name
        // ("downtown", "north") appearing in the hint, or vice versa.
        city.centers.iter().find(|c| {
            c.name
                .to_lowercase()
                .split(|ch: char| !ch.is_alphanumeric())
                .filter(|w| w.len() > 3 && *w != "service" && *w != "center")
                .any(|w| hint_lower.contains(w))
        })
    }

    /// Deterministic hourly slots for a center on a given date. Empty when
    /// the center is closed that day.
    pub fn available_times(&self, center: &ServiceCenter, date: NaiveDate) -> Vec<NaiveTime> {
        let weekday = date.format("%a").to_string().to_lowercase();
        let mut times = vec![];
        for window in &center.hours {
            if window.day.to_lowercase() != weekday {
                continue;
            }
            let (Ok(start), Ok(end)) = (parse_time(&window.start), parse_time(&window.end))
            else {
                continue;
            };
            let mut minute = start;
            while minute + 60 <= end {
                if let Some(t) = NaiveTime::from_hms_opt(minute / 60, minute % 60, 0) {
                    times.push(t);
                }
                minute += 60;
            }
        }
        times.sort();
        times.dedup();
        times
    }

    pub fn hours_summary(&self, center: &ServiceCenter) -> String {
        let day_order = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
        let mut windows = center.hours.clone();
        windows.sort_by_key(|w| {
            day_order
                .iter()
                .position(|d| *d == w.day.to_lowercase())
                .unwrap_or(7)
        });
        windows
            .iter()
            .map(|w| format!("{}: {}-{}", capitalize(&w.day), w.start, w.end))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + &c.as_str().to_lowercase(),
    }
}

/// Position named by an ordinal reference, if the hint contains one.
fn ordinal_index(hint: &str) -> Option<usize> {
    for word in hint.split(|ch: char| !ch.is_alphanumeric()) {
        let idx = match word {
            "first" | "1st" | "1" => Some(0),
            "second" | "2nd" | "2" => Some(1),
            "third" | "3rd" | "3" => Some(2),
            "fourth" | "4th" | "4" => Some(3),
            "fifth" | "5th" | "5" => Some(4),
            _ => None,
        };
        if idx.is_some() {
            return idx;
        }
    }
    None
}

fn parse_weekday(s: &str) -> anyhow::Result<()> {
    match s.to_lowercase().as_str() {
        "mon" | "tue" | "wed" | "thu" | "fri" | "sat" | "sun" => Ok(()),
        _ => Err(anyhow::anyhow!("invalid weekday: {s}")),
    }
}

/// Parses "HH:MM" into minutes past midnight.
fn parse_time(s: &str) -> anyhow::Result<u32> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow::anyhow!("invalid time format: {s}"));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid hour in: {s}"))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid minute in: {s}"))?;
    if hour > 23 || minute > 59 {
        return Err(anyhow::anyhow!("time out of range: {s}"));
    }
    Ok(hour * 60 + minute)
}
