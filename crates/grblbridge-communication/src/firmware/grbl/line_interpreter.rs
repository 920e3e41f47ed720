//! Outbound line interpretation
//!
//! Extracts the motion mode and feed rate intent from a single G-code line.
//! Only what the feed rate tracker needs is recognized; everything else is
//! [`LineIntent::Other`].

use regex::Regex;
use std::sync::OnceLock;

/// What a transmitted line asks the device to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineIntent {
    /// `G0` rapid move
    Seek,
    /// `G1` feed move with the axis words and feed word it carries
    Feed {
        /// X word
        x: Option<f64>,
        /// Y word
        y: Option<f64>,
        /// Z word
        z: Option<f64>,
        /// F word
        f: Option<f64>,
    },
    /// `G20` inch mode
    Inches,
    /// `G21` millimeter mode
    Millimeters,
    /// Anything else
    Other,
}

impl LineIntent {
    /// Planar feed rate carried by the line, if any
    ///
    /// Lines with a Z word are plunges and do not count.
    pub fn planar_feed_rate(&self) -> Option<f64> {
        match self {
            LineIntent::Feed { z: None, f, .. } => *f,
            _ => None,
        }
    }
}

fn gcode_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"G(\d+)(.*)").expect("invalid regex pattern"))
}

fn feed_words_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let num = r"([+-]?(?:\d*\.\d+|\d+\.?))";
        Regex::new(&format!(
            r"^\s*(?:X{num})?\s*(?:Y{num})?\s*(?:Z{num})?\s*(?:F{num})?"
        ))
        .expect("invalid regex pattern")
    })
}

/// Interpret one outbound line
pub fn interpret(line: &str) -> LineIntent {
    let Some(caps) = gcode_regex().captures(line) else {
        return LineIntent::Other;
    };
    let rest = caps.get(2).map_or("", |m| m.as_str());
    match &caps[1] {
        "0" | "00" => LineIntent::Seek,
        "20" => LineIntent::Inches,
        "21" => LineIntent::Millimeters,
        "1" | "01" => {
            let word = |words: &regex::Captures<'_>, i: usize| {
                words.get(i).and_then(|m| m.as_str().parse::<f64>().ok())
            };
            match feed_words_regex().captures(rest) {
                Some(words) => LineIntent::Feed {
                    x: word(&words, 1),
                    y: word(&words, 2),
                    z: word(&words, 3),
                    f: word(&words, 4),
                },
                None => LineIntent::Feed {
                    x: None,
                    y: None,
                    z: None,
                    f: None,
                },
            }
        }
        _ => LineIntent::Other,
    }
}
