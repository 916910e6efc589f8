use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the named partitions of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetSplit {
    Train,
    Val,
    Test,
}

impl DatasetSplit {
    /// All splits in processing order.
    pub const ALL: [DatasetSplit; 3] = [DatasetSplit::Train, DatasetSplit::Val, DatasetSplit::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Val => "val",
            DatasetSplit::Test => "test",
        }
    }
}

impl fmt::Display for DatasetSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetSplit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(DatasetSplit::Train),
            "val" | "valid" | "validation" => Ok(DatasetSplit::Val),
            "test" => Ok(DatasetSplit::Test),
            other => Err(format!("unknown split '{}'", other)),
        }
    }
}

/// Normalizes a user-supplied split selection: deduplicated, in `ALL` order.
/// An empty selection means every split.
pub fn normalize_splits(splits: &[DatasetSplit]) -> Vec<DatasetSplit> {
    if splits.is_empty() {
        return DatasetSplit::ALL.to_vec();
    }
    DatasetSplit::ALL
        .into_iter()
        .filter(|s| splits.contains(s))
        .collect()
}
