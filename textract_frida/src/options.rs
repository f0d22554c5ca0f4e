//! Options for the text extractor, and helpers to read hook offsets from user input and from
//! metadata dumps.

use std::{
    collections::HashSet,
    io::BufRead,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use textract_bolts::Error;

/// The environment variable [`TextractOptions::parse_env_options`] reads
pub const OPTIONS_ENV: &str = "TEXTRACT_OPTIONS";

/// A representation of the various textract options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextractOptions {
    /// Name of the module whose setters are hooked
    pub module_name: String,
    /// How long the attach worker waits for the module, in milliseconds
    pub module_wait_ms: u64,
    /// How long a dump waits for the module, in milliseconds
    pub dump_wait_ms: u64,
    /// Export of the module that creates managed strings
    pub string_factory: String,
    /// Directory holding one sub directory per package for the text store
    pub store_root: PathBuf,
    /// Where finished dumps are copied to
    pub export_dir: PathBuf,
    /// Offsets to hook, relative to the module base
    pub offsets: Vec<usize>,
    /// Regular expressions for texts that must not be stored
    pub filter_patterns: Vec<String>,
    /// Upper bound of concurrently running workers
    pub max_workers: usize,
}

impl Default for TextractOptions {
    fn default() -> Self {
        Self {
            module_name: "libil2cpp.so".to_string(),
            module_wait_ms: 10_000,
            dump_wait_ms: 30_000,
            string_factory: "il2cpp_string_new".to_string(),
            store_root: PathBuf::from("/data/data"),
            export_dir: PathBuf::from("/sdcard/Download"),
            offsets: Vec::new(),
            filter_patterns: Vec::new(),
            max_workers: 4,
        }
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64, Error> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| {
            Error::illegal_argument(format!(
                "option {name} expects milliseconds, got {value:?}"
            ))
        })
}

impl TextractOptions {
    /// Parse the options from the "`TEXTRACT_OPTIONS`" environment variable.
    /// Unset means defaults.
    pub fn parse_env_options() -> Result<Self, Error> {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => Self::parse_options(&value),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(err) => Err(Error::illegal_argument(format!("{OPTIONS_ENV}: {err}"))),
        }
    }

    /// Parse `:` separated `name=value` options on top of the defaults.
    ///
    /// Known names are `module`, `module-wait`, `dump-wait`, `string-factory`, `store-root`,
    /// `export-dir`, `offsets` (comma separated), `filter` (may repeat) and `workers`.
    pub fn parse_options(options: &str) -> Result<Self, Error> {
        let mut parsed = Self::default();

        for option in options.trim().split(':').filter(|o| !o.trim().is_empty()) {
            let Some((name, value)) = option.split_once('=') else {
                return Err(Error::illegal_argument(format!(
                    "Expected a '=' in option string {option:?}"
                )));
            };
            let value = value.trim();
            match name.trim() {
                "module" => parsed.module_name = value.to_string(),
                "module-wait" => parsed.module_wait_ms = parse_millis(name, value)?,
                "dump-wait" => parsed.dump_wait_ms = parse_millis(name, value)?,
                "string-factory" => parsed.string_factory = value.to_string(),
                "store-root" => parsed.store_root = PathBuf::from(value),
                "export-dir" => parsed.export_dir = PathBuf::from(value),
                "offsets" => parsed.offsets = parse_offset_list(value),
                "filter" => parsed.filter_patterns.push(value.to_string()),
                "workers" => parsed.max_workers = value.parse()?,
                other => {
                    return Err(Error::key_not_found(format!("unknown option {other:?}")));
                }
            }
        }

        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse options from a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(document: &str) -> Result<Self, Error> {
        let parsed: Self = toml::from_str(document)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load options from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml_str(&document)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.module_name.is_empty() {
            return Err(Error::illegal_argument("module name must not be empty"));
        }
        if self.max_workers == 0 {
            return Err(Error::illegal_argument("at least one worker is required"));
        }
        Ok(())
    }

    /// The module wait window
    #[must_use]
    pub fn module_wait(&self) -> Duration {
        Duration::from_millis(self.module_wait_ms)
    }

    /// The dump wait window
    #[must_use]
    pub fn dump_wait(&self) -> Duration {
        Duration::from_millis(self.dump_wait_ms)
    }
}

/// Parse an offset given as `0x` prefixed hex or as decimal
#[must_use]
pub fn parse_offset(input: &str) -> Option<usize> {
    let value = input.trim();
    if value.is_empty() {
        return None;
    }
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Parse a comma separated offset list, dropping entries that do not parse
#[must_use]
pub fn parse_offset_list(input: &str) -> Vec<usize> {
    input.split(',').filter_map(parse_offset).collect()
}

/// Render an offset the way [`parse_offset`] reads it back
#[must_use]
pub fn format_offset(offset: usize) -> String {
    format!("{offset:#x}")
}

fn set_text_regex() -> &'static (Regex, Regex) {
    static RES: OnceLock<(Regex, Regex)> = OnceLock::new();
    RES.get_or_init(|| {
        (
            Regex::new(r"(?i)set_Text\s*\(").expect("set_Text regex is valid"),
            Regex::new(r"RVA:\s*(0x[0-9a-fA-F]+|\d+)").expect("RVA regex is valid"),
        )
    })
}

/// Collect the offsets of `set_Text` methods from a metadata dump (`dump.cs`).
///
/// The dumper writes a `// RVA: 0x… Offset: 0x… VA: 0x…` comment on the line above every
/// method; an offset is taken whenever that method is a `set_Text(` declaration. Offsets are
/// returned distinct, in file order, at most `max` of them.
pub fn offsets_from_dump<R: BufRead>(reader: R, max: usize) -> Result<Vec<usize>, Error> {
    let (set_text, rva) = set_text_regex();
    let mut seen = HashSet::new();
    let mut offsets = Vec::new();
    let mut previous: Option<String> = None;

    for line in reader.lines() {
        if offsets.len() >= max {
            break;
        }
        let line = line?;
        if set_text.is_match(&line) {
            let offset = previous
                .as_deref()
                .and_then(|comment| rva.captures(comment))
                .and_then(|caps| caps.get(1))
                .and_then(|raw| parse_offset(raw.as_str()));
            if let Some(offset) = offset {
                if seen.insert(offset) {
                    offsets.push(offset);
                }
            }
        }
        previous = Some(line);
    }

    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serial_test::serial;
    use textract_bolts::Error;

    use super::{
        format_offset, offsets_from_dump, parse_offset, parse_offset_list, TextractOptions,
        OPTIONS_ENV,
    };

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("0x1a2b"), Some(0x1a2b));
        assert_eq!(parse_offset(" 0X10 "), Some(16));
        assert_eq!(parse_offset("4096"), Some(4096));
        assert_eq!(parse_offset(""), None);
        assert_eq!(parse_offset("0xzz"), None);
        assert_eq!(parse_offset("-5"), None);
        assert_eq!(parse_offset(&format_offset(0x7000)), Some(0x7000));
    }

    #[test]
    fn test_parse_offset_list() {
        assert_eq!(
            parse_offset_list("0x1000, 8192,, junk ,0x3000"),
            vec![0x1000, 0x2000, 0x3000]
        );
        assert!(parse_offset_list("").is_empty());
    }

    #[test]
    fn test_parse_options() {
        let options = TextractOptions::parse_options(
            "module=libgame.so:module-wait=500:offsets=0x1000,0x2000:filter=^\\d+$:filter=(?i)loading:workers=2",
        )
        .unwrap();
        assert_eq!(options.module_name, "libgame.so");
        assert_eq!(options.module_wait_ms, 500);
        assert_eq!(options.offsets, vec![0x1000, 0x2000]);
        assert_eq!(options.filter_patterns.len(), 2);
        assert_eq!(options.max_workers, 2);
        assert_eq!(options.dump_wait_ms, 30_000);
    }

    #[test]
    fn test_parse_options_errors() {
        assert!(matches!(
            TextractOptions::parse_options("module"),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            TextractOptions::parse_options("colour=blue"),
            Err(Error::KeyNotFound(_))
        ));
        assert!(TextractOptions::parse_options("module-wait=soon").is_err());
        assert!(TextractOptions::parse_options("workers=0").is_err());
        assert!(TextractOptions::parse_options("module=").is_err());
    }

    #[test]
    fn test_toml() {
        let options = TextractOptions::from_toml_str(
            r#"
module_name = "libil2cpp.so"
offsets = [4096, 8192]
store_root = "/tmp/textract"
"#,
        )
        .unwrap();
        assert_eq!(options.offsets, vec![0x1000, 0x2000]);
        assert_eq!(options.store_root, std::path::PathBuf::from("/tmp/textract"));
        assert_eq!(options.max_workers, 4);

        assert!(TextractOptions::from_toml_str("offsets = \"nope\"").is_err());
    }

    #[test]
    #[serial]
    fn test_env_options() {
        std::env::set_var(OPTIONS_ENV, "offsets=0x10");
        let options = TextractOptions::parse_env_options().unwrap();
        std::env::remove_var(OPTIONS_ENV);
        assert_eq!(options.offsets, vec![0x10]);
        assert_eq!(
            TextractOptions::parse_env_options().unwrap(),
            TextractOptions::default()
        );
    }

    #[test]
    fn test_offsets_from_dump() {
        let dump = "\
public class Text : MaskableGraphic
{
\t// RVA: 0x1A2B3C Offset: 0x1A2B3C VA: 0x1A2B3C Slot: 75
\tpublic virtual string get_text() { }

\t// RVA: 0x1A2B40 Offset: 0x1A2B40 VA: 0x1A2B40 Slot: 76
\tpublic virtual void set_text(string value) { }
}
public class TMP_Text
{
\t// RVA: 0x2000 Offset: 0x2000 VA: 0x2000
\tpublic void set_Text ( string value) { }
\t// RVA: 0x2000 Offset: 0x2000 VA: 0x2000
\tpublic void set_Text(string value) { }
\tpublic void set_Text(StringBuilder sb) { }
\t// RVA: 0x3000 Offset: 0x3000 VA: 0x3000
\tpublic void SetText(string value) { }
}
";
        let offsets = offsets_from_dump(Cursor::new(dump), 10).unwrap();
        assert_eq!(offsets, vec![0x1A_2B40, 0x2000]);

        let capped = offsets_from_dump(Cursor::new(dump), 1).unwrap();
        assert_eq!(capped, vec![0x1A_2B40]);
    }
}
