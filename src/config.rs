// Interpreter settings.
//
// Loaded from an optional RON file so a host can resize the memory regions
// without recompiling. Missing file means defaults.

use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Size of the per-scope bump region, in KB.
    pub stack_kb: u64,
    /// Size of the AST-construction bump region, in KB.
    pub init_kb: u64,
    /// Size of the cross-frame return-value region, in KB.
    pub return_kb: u64,
    /// Print every opcode as it executes.
    pub trace: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            stack_kb: 128,
            init_kb: 32,
            return_kb: 16,
            trace: false,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings, String> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("couldn't read {}: {}", path.as_ref().display(), e))?;
        ron::de::from_str(&text).map_err(|e| format!("bad settings file: {}", e))
    }

    /// Settings for the current directory: `teal.ron` if present, else defaults.
    pub fn discover() -> Settings {
        if Path::new("teal.ron").exists() {
            match Settings::load("teal.ron") {
                Ok(s) => return s,
                Err(e) => eprintln!("{}", e),
            }
        }
        Settings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.stack_kb, 128);
        assert_eq!(s.init_kb, 32);
        assert_eq!(s.return_kb, 16);
        assert!(!s.trace);
    }

    #[test]
    fn partial_ron_overrides() {
        let s: Settings = ron::de::from_str("(stack_kb: 256, trace: true)").unwrap();
        assert_eq!(s.stack_kb, 256);
        assert_eq!(s.init_kb, 32);
        assert!(s.trace);
    }
}
