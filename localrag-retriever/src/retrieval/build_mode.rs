use serde::{Deserialize, Serialize};

/// How a build treats an existing knowledge base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Replace the existing store and metadata with a freshly built one.
    /// The old store stays readable until the new one is complete.
    Overwrite,

    /// Add chunks to the existing store. Files whose content is already
    /// stored are skipped, and the embedding dimension must match.
    Append,
}

impl BuildMode {
    pub fn is_append(&self) -> bool {
        matches!(self, BuildMode::Append)
    }

    /// Whether an existing store with a different dimension can be replaced
    pub fn replaces_existing(&self) -> bool {
        matches!(self, BuildMode::Overwrite)
    }
}

impl Default for BuildMode {
    fn default() -> Self {
        Self::Overwrite
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::Overwrite => write!(f, "overwrite"),
            BuildMode::Append => write!(f, "append"),
        }
    }
}

impl std::str::FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "overwrite" | "rebuild" | "replace" => Ok(BuildMode::Overwrite),
            "append" | "add" => Ok(BuildMode::Append),
            _ => Err(format!(
                "Invalid build mode: '{s}'. Valid values are: overwrite, append"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mode_properties() {
        assert!(BuildMode::Append.is_append());
        assert!(!BuildMode::Append.replaces_existing());
        assert!(!BuildMode::Overwrite.is_append());
        assert!(BuildMode::Overwrite.replaces_existing());
    }

    #[test]
    fn test_build_mode_default() {
        assert_eq!(BuildMode::default(), BuildMode::Overwrite);
    }

    #[test]
    fn test_build_mode_display() {
        assert_eq!(BuildMode::Overwrite.to_string(), "overwrite");
        assert_eq!(BuildMode::Append.to_string(), "append");
    }

    #[test]
    fn test_build_mode_from_str() {
        assert_eq!("overwrite".parse::<BuildMode>().unwrap(), BuildMode::Overwrite);
        assert_eq!("REBUILD".parse::<BuildMode>().unwrap(), BuildMode::Overwrite);
        assert_eq!("append".parse::<BuildMode>().unwrap(), BuildMode::Append);
        assert_eq!("Add".parse::<BuildMode>().unwrap(), BuildMode::Append);

        let err = "merge".parse::<BuildMode>().unwrap_err();
        assert!(err.contains("Invalid build mode"));
    }

    #[test]
    fn test_build_mode_serialization() {
        let json = serde_json::to_string(&BuildMode::Append).unwrap();
        assert_eq!(json, "\"append\"");
        let mode: BuildMode = serde_json::from_str("\"overwrite\"").unwrap();
        assert_eq!(mode, BuildMode::Overwrite);
    }
}
