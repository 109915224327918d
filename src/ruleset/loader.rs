use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::compile::compile;
use super::model::CompiledRuleSet;

/// Raw, strict-YAML shape of a rule-set file. Compilation into the immutable
/// [`CompiledRuleSet`] happens in [`super::compile`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRuleSet {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_body_size: Option<usize>,
    #[serde(default)]
    pub default_remediation: Option<RawRemediation>,
    #[serde(default)]
    pub blocked_http_code: Option<u16>,
    #[serde(default)]
    pub passed_http_code: Option<u16>,
    #[serde(default)]
    pub inband_rules: Vec<RawRule>,
    #[serde(default)]
    pub outofband_rules: Vec<RawRule>,
    #[serde(default)]
    pub on_load: Vec<RawHook>,
    #[serde(default)]
    pub pre_eval: Vec<RawHook>,
    #[serde(default)]
    pub post_eval: Vec<RawHook>,
    #[serde(default)]
    pub on_match: Vec<RawHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawRemediation {
    Allow,
    Captcha,
    Custom,
    Deny,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRule {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub remediation: Option<RawRemediation>,
    #[serde(default)]
    pub custom_status: Option<u16>,
    #[serde(default)]
    pub custom_body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHook {
    #[serde(default)]
    pub filter: Option<RawHookFilter>,
    pub apply: Vec<RawHookAction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHookFilter {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub rule_name: Option<String>,
    #[serde(default)]
    pub disposition: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// One action entry. Exactly one field must be set; compilation rejects
/// anything else.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHookAction {
    #[serde(default)]
    pub set_disposition: Option<String>,
    #[serde(default)]
    pub set_status: Option<u16>,
    #[serde(default)]
    pub set_body: Option<String>,
    #[serde(default)]
    pub disable_rule: Option<String>,
}

/// Resolves `appsec_config: <name>` to `<rules_dir>/<name>.yaml` and compiles it.
pub fn load_by_name(name: &str, rules_dir: &Path) -> Result<CompiledRuleSet> {
    let path = rules_dir.join(format!("{name}.yaml"));
    load_file(&path, name)
}

pub fn load_by_path(path: &Path) -> Result<CompiledRuleSet> {
    let fallback_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "appsec".to_string());
    load_file(path, &fallback_name)
}

fn load_file(path: &Path, fallback_name: &str) -> Result<CompiledRuleSet> {
    let raw_text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule set {}", path.display()))?;
    let raw: RawRuleSet = serde_yaml::from_str(&raw_text)
        .with_context(|| format!("cannot parse rule set {}", path.display()))?;
    let data_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    compile(raw, fallback_name, &data_dir)
        .with_context(|| format!("invalid rule set {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ruleset(dir: &Path, name: &str, yaml: &str) -> std::path::PathBuf {
        let path = dir.join(format!("{name}.yaml"));
        let mut file = std::fs::File::create(&path).expect("create rule set file");
        file.write_all(yaml.as_bytes()).expect("write rule set");
        path
    }

    #[test]
    fn loads_ruleset_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_ruleset(
            dir.path(),
            "default",
            "inband_rules:\n  - name: block-post\n    methods: [POST]\n",
        );
        let ruleset = load_by_name("default", dir.path()).expect("load rule set");
        assert_eq!(ruleset.name.as_ref(), "default");
        assert_eq!(ruleset.inband.len(), 1);
        assert_eq!(ruleset.data_dir, dir.path());
    }

    #[test]
    fn loads_ruleset_by_path_with_file_stem_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_ruleset(dir.path(), "edge-rules", "outofband_rules:\n  - name: watch\n");
        let ruleset = load_by_path(&path).expect("load rule set");
        assert_eq!(ruleset.name.as_ref(), "edge-rules");
        assert_eq!(ruleset.outofband.len(), 1);
    }

    #[test]
    fn explicit_name_wins_over_file_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_ruleset(dir.path(), "whatever", "name: virtual-patching\n");
        let ruleset = load_by_path(&path).expect("load rule set");
        assert_eq!(ruleset.name.as_ref(), "virtual-patching");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_by_name("absent", dir.path()).expect_err("must fail");
        assert!(
            err.to_string().contains("failed to read rule set"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_ruleset(dir.path(), "bad", "rules:\n  - name: typo-key\n");
        let err = load_by_name("bad", dir.path()).expect_err("must fail");
        assert!(
            err.to_string().contains("cannot parse rule set"),
            "unexpected error: {err}"
        );
    }
}
