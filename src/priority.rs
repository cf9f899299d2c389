//! Deterministic task priority scoring
//!
//! Pure function of source, title, and description: a base weight per
//! source, additive keyword boosts, and a bonus for tightly-scoped tasks
//! with short descriptions. Scores clamp to [0, 100].

use crate::task::TaskSource;

/// Boost groups; a group fires once if any of its keywords matches
const BOOSTS: &[(&[&str], u32)] = &[
    (&["security", "vulnerability"], 30),
    (&["bug", "fix", "crash", "error"], 25),
    (&["fixme"], 20),
    (&["performance"], 15),
    (&["hack", "xxx"], 15),
    (&["refactor", "cleanup"], 10),
    (&["test"], 8),
    (&["docs"], 5),
];

/// Descriptions shorter than this earn a linearly-scaled bonus
const SHORT_DESCRIPTION_LIMIT: usize = 200;
const SHORT_DESCRIPTION_MAX_BONUS: f64 = 15.0;

fn source_base(source: TaskSource) -> u32 {
    match source {
        TaskSource::Manual => 40,
        TaskSource::QueueFile => 35,
        TaskSource::Issue => 30,
        TaskSource::AutoTemplate => 25,
        TaskSource::CodeComment => 20,
        TaskSource::Markdown => 15,
    }
}

/// Score a task in [0, 100]
pub fn score(source: TaskSource, title: &str, description: Option<&str>) -> u8 {
    let haystack = match description {
        Some(desc) => format!("{title} {desc}").to_lowercase(),
        None => title.to_lowercase(),
    };

    let mut total = source_base(source);
    for (keywords, boost) in BOOSTS {
        if keywords.iter().any(|kw| haystack.contains(kw)) {
            total += boost;
        }
    }

    let desc_len = description.map_or(0, str::len);
    if desc_len < SHORT_DESCRIPTION_LIMIT {
        let scale = (SHORT_DESCRIPTION_LIMIT - desc_len) as f64
            / SHORT_DESCRIPTION_LIMIT as f64;
        total += (SHORT_DESCRIPTION_MAX_BONUS * scale).round() as u32;
    }

    total.min(100) as u8
}
