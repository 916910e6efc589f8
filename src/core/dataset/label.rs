use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// One annotation line: `class_id x_center y_center width height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelLine {
    pub class_id: u32,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

/// Why a label line could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineError {
    #[error("insufficient values (expected 5: class_id x y w h), found {0}")]
    TooFewTokens(usize),
    #[error("invalid class ID: {0}")]
    BadClassId(String),
    #[error("invalid numeric value at position {position}: {token}")]
    BadValue { position: usize, token: String },
}

impl LabelLine {
    pub const FIELD_NAMES: [&'static str; 4] = ["x_center", "y_center", "width", "height"];

    /// Parses one whitespace-separated line. Tokens past the fifth are ignored.
    pub fn parse(line: &str) -> Result<Self, LineError> {
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() < 5 {
            return Err(LineError::TooFewTokens(values.len()));
        }

        let class_id = values[0]
            .parse::<u32>()
            .map_err(|_| LineError::BadClassId(values[0].to_string()))?;

        let mut coords = [0.0f64; 4];
        for (i, token) in values[1..5].iter().enumerate() {
            coords[i] = token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| LineError::BadValue {
                    position: i + 1,
                    token: token.to_string(),
                })?;
        }

        Ok(Self {
            class_id,
            x_center: coords[0],
            y_center: coords[1],
            width: coords[2],
            height: coords[3],
        })
    }

    pub fn coords(&self) -> [f64; 4] {
        [self.x_center, self.y_center, self.width, self.height]
    }

    /// First coordinate outside `[0, 1]`, as `(position, value)` with position 1..=4.
    pub fn first_out_of_range(&self) -> Option<(usize, f64)> {
        self.coords()
            .into_iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(v))
            .map(|(i, v)| (i + 1, v))
    }

    pub fn is_normalized(&self) -> bool {
        self.first_out_of_range().is_none()
    }
}

impl fmt::Display for LabelLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6} {:.6} {:.6} {:.6}",
            self.class_id, self.x_center, self.y_center, self.width, self.height
        )
    }
}

/// Parsed contents of a label file. Malformed lines are kept aside with their
/// 1-based line number instead of failing the whole file.
#[derive(Debug, Clone, Default)]
pub struct LabelFile {
    pub lines: Vec<LabelLine>,
    pub malformed: Vec<(usize, LineError)>,
}

impl LabelFile {
    pub fn parse(content: &str) -> Self {
        let mut file = LabelFile::default();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match LabelLine::parse(line) {
                Ok(parsed) => file.lines.push(parsed),
                Err(e) => file.malformed.push((idx + 1, e)),
            }
        }
        file
    }

    pub fn class_ids(&self) -> BTreeSet<u32> {
        self.lines.iter().map(|l| l.class_id).collect()
    }

    pub fn to_content(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

/// Reads and parses a label file.
pub fn read_label_file(label_path: &Path) -> io::Result<LabelFile> {
    let content = fs::read_to_string(label_path)?;
    Ok(LabelFile::parse(&content))
}

/// Non-blank, trimmed lines of a label file with their 1-based line numbers.
pub fn read_raw_lines(label_path: &Path) -> io::Result<Vec<(usize, String)>> {
    let content = fs::read_to_string(label_path)?;
    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l.trim().to_string()))
        .collect())
}

/// Class ids present in a label file. A missing or unreadable file yields an
/// empty set; an image without a label has no classes.
pub fn label_class_ids(label_path: &Path) -> BTreeSet<u32> {
    match read_label_file(label_path) {
        Ok(file) => file.class_ids(),
        Err(_) => BTreeSet::new(),
    }
}

pub fn write_label_file(label_path: &Path, lines: &[LabelLine]) -> io::Result<()> {
    let file = LabelFile {
        lines: lines.to_vec(),
        malformed: Vec::new(),
    };
    fs::write(label_path, file.to_content())
}
