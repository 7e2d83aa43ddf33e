//! Lift manifest emission.
//!
//! The manifest is the external assembler's input and its shape is owned by
//! that tool's published schema; field names and the prefixed-key env
//! encoding below must be reproduced exactly for compatibility.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::model::{Command, Env, File, FileSource, InterpreterGroup, ScieJump};
use crate::platform::Platform;

/// Build provenance recorded in the manifest when requested.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub note: String,
    pub version: String,
    pub binary_url: String,
}

/// Everything that goes into one per-platform manifest.
pub struct Manifest<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub load_dotenv: bool,
    pub scie_jump: &'a ScieJump,
    pub platform: Platform,
    pub interpreter_groups: &'a [InterpreterGroup],
    pub files: &'a [File],
    pub commands: &'a [Command],
    pub bindings: &'a [Command],
    /// File name to remote locator, for files the scie fetches at runtime.
    pub fetch_urls: &'a BTreeMap<String, String>,
    pub build_info: Option<BuildInfo>,
}

/// Serialize the manifest as pretty JSON with a trailing newline.
pub fn emit_manifest(out: &mut dyn Write, manifest: &Manifest<'_>) -> Result<()> {
    let mut lift = Map::new();
    lift.insert("name".to_string(), json!(manifest.name));
    if let Some(description) = manifest.description {
        lift.insert("description".to_string(), json!(description));
    }
    if manifest.load_dotenv {
        lift.insert("load_dotenv".to_string(), json!(true));
    }
    lift.insert("platforms".to_string(), json!([manifest.platform.as_str()]));
    if !manifest.interpreter_groups.is_empty() {
        lift.insert(
            "interpreter_groups".to_string(),
            Value::Array(
                manifest
                    .interpreter_groups
                    .iter()
                    .map(|group| {
                        json!({
                            "id": group.id,
                            "selector": group.selector,
                            "members": group.members,
                        })
                    })
                    .collect(),
            ),
        );
    }
    lift.insert(
        "files".to_string(),
        Value::Array(manifest.files.iter().map(file_value).collect()),
    );

    let mut boot = Map::new();
    boot.insert(
        "commands".to_string(),
        commands_value(manifest.commands, "command")?,
    );
    if !manifest.bindings.is_empty() {
        boot.insert(
            "bindings".to_string(),
            commands_value(manifest.bindings, "binding")?,
        );
    }
    lift.insert("boot".to_string(), Value::Object(boot));

    let mut scie = Map::new();
    scie.insert("lift".to_string(), Value::Object(lift));
    if let Some(version) = &manifest.scie_jump.version {
        scie.insert("jump".to_string(), json!({"version": version.to_string()}));
    }

    let mut root = Map::new();
    root.insert("scie".to_string(), Value::Object(scie));
    if !manifest.fetch_urls.is_empty() {
        root.insert("ptex".to_string(), json!(manifest.fetch_urls));
    }
    if let Some(build_info) = &manifest.build_info {
        root.insert(
            "science".to_string(),
            json!({
                "note": build_info.note,
                "version": build_info.version,
                "url": build_info.binary_url,
            }),
        );
    }

    serde_json::to_writer_pretty(&mut *out, &Value::Object(root))
        .context("Failed to serialize the lift manifest")?;
    out.write_all(b"\n")
        .context("Failed to write the lift manifest")?;
    Ok(())
}

fn file_value(file: &File) -> Value {
    let mut value = Map::new();
    value.insert("name".to_string(), json!(file.name));
    if let Some(key) = &file.key {
        value.insert("key".to_string(), json!(key));
    }
    if let Some(digest) = &file.digest {
        value.insert("size".to_string(), json!(digest.size));
        value.insert("hash".to_string(), json!(digest.fingerprint));
    }
    if let Some(file_type) = file.file_type {
        value.insert("type".to_string(), json!(file_type.as_str()));
    }
    if file.executable {
        value.insert("executable".to_string(), json!(true));
    }
    if file.eager_extract {
        value.insert("eager_extract".to_string(), json!(true));
    }
    match &file.source {
        FileSource::Provided => {}
        FileSource::Fetch(_) => {
            value.insert("source".to_string(), json!("fetch"));
        }
        FileSource::Binding(binding) => {
            value.insert("source".to_string(), json!(binding));
        }
    }
    Value::Object(value)
}

/// Commands and bindings are keyed by name; the unnamed default command is
/// keyed by the empty string.
fn commands_value(commands: &[Command], kind: &str) -> Result<Value> {
    let mut by_name = Map::new();
    for command in commands {
        let name = command.name.clone().unwrap_or_default();
        if by_name.contains_key(&name) {
            match command.name.as_deref() {
                Some(name) => bail!("More than one {kind} is named '{name}'."),
                None => bail!("More than one {kind} has no name."),
            }
        }
        by_name.insert(name, command_value(command));
    }
    Ok(Value::Object(by_name))
}

fn command_value(command: &Command) -> Value {
    let mut value = Map::new();
    if let Some(description) = &command.description {
        value.insert("description".to_string(), json!(description));
    }
    value.insert("exe".to_string(), json!(command.exe));
    if !command.args.is_empty() {
        value.insert("args".to_string(), json!(command.args));
    }
    if !command.env.is_empty() {
        value.insert("env".to_string(), env_value(&command.env));
    }
    Value::Object(value)
}

/// The assembler's env encoding: `=NAME` entries are exact (null removes,
/// a value replaces), `#pattern` entries remove by regex, and bare names
/// set defaults.
fn env_value(env: &Env) -> Value {
    let mut value = Map::new();
    for name in &env.remove_exact {
        value.insert(format!("={name}"), Value::Null);
    }
    for pattern in &env.remove_re {
        value.insert(format!("#{pattern}"), Value::Null);
    }
    for (name, val) in &env.replace {
        value.insert(format!("={name}"), json!(val));
    }
    for (name, val) in &env.default {
        value.insert(name.clone(), json!(val));
    }
    Value::Object(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Digest, FileType};
    use std::collections::BTreeMap;

    fn manifest_json(manifest: &Manifest<'_>) -> Value {
        let mut buf = Vec::new();
        emit_manifest(&mut buf, manifest).unwrap();
        assert_eq!(Some(&b'\n'), buf.last());
        serde_json::from_slice(&buf).unwrap()
    }

    #[test]
    fn minimal_manifest_shape() {
        let command = Command {
            name: None,
            description: None,
            exe: "/bin/echo".to_string(),
            args: vec!["hi".to_string()],
            env: Env::default(),
        };
        let fetch_urls = BTreeMap::new();
        let value = manifest_json(&Manifest {
            name: "echoer",
            description: None,
            load_dotenv: false,
            scie_jump: &ScieJump::default(),
            platform: Platform::LinuxX86_64,
            interpreter_groups: &[],
            files: &[],
            commands: std::slice::from_ref(&command),
            bindings: &[],
            fetch_urls: &fetch_urls,
            build_info: None,
        });

        assert_eq!("echoer", value["scie"]["lift"]["name"]);
        assert_eq!(json!(["linux-x86_64"]), value["scie"]["lift"]["platforms"]);
        assert_eq!(
            "/bin/echo",
            value["scie"]["lift"]["boot"]["commands"][""]["exe"]
        );
        assert_eq!(Value::Null, value["ptex"]);
        assert_eq!(Value::Null, value["scie"]["jump"]);
        assert_eq!(Value::Null, value["scie"]["lift"]["boot"]["bindings"]);
    }

    #[test]
    fn env_uses_prefixed_keys() {
        let mut env = Env::default();
        env.remove_exact.insert("PYTHONPATH".to_string());
        env.remove_re.insert("^LD_.*".to_string());
        env.replace.insert("HOME".to_string(), "/tmp".to_string());
        env.default.insert("LANG".to_string(), "C".to_string());
        let value = env_value(&env);

        assert_eq!(Value::Null, value["=PYTHONPATH"]);
        assert_eq!(Value::Null, value["#^LD_.*"]);
        assert_eq!("/tmp", value["=HOME"]);
        assert_eq!("C", value["LANG"]);
    }

    #[test]
    fn file_entries_carry_digest_and_source() {
        let file = File {
            name: "model.bin".to_string(),
            key: Some("model".to_string()),
            digest: Some(Digest {
                size: 42,
                fingerprint: "feed".to_string(),
            }),
            file_type: Some(FileType::Blob),
            executable: true,
            eager_extract: false,
            source: FileSource::Fetch(None),
        };
        let value = file_value(&file);
        assert_eq!("model.bin", value["name"]);
        assert_eq!("model", value["key"]);
        assert_eq!(42, value["size"]);
        assert_eq!("feed", value["hash"]);
        assert_eq!("blob", value["type"]);
        assert_eq!(true, value["executable"]);
        assert_eq!("fetch", value["source"]);
        assert_eq!(Value::Null, value["eager_extract"]);
    }

    #[test]
    fn duplicate_command_names_rejected() {
        let command = Command {
            name: Some("run".to_string()),
            description: None,
            exe: "/bin/true".to_string(),
            args: vec![],
            env: Env::default(),
        };
        let err = commands_value(&[command.clone(), command], "command").unwrap_err();
        assert!(err.to_string().contains("'run'"), "{err}");
    }

    #[test]
    fn jump_version_and_fetch_urls_included_when_present() {
        let command = Command {
            name: None,
            description: None,
            exe: "{ptex}".to_string(),
            args: vec![],
            env: Env::default(),
        };
        let scie_jump = ScieJump {
            version: Some(semver::Version::new(1, 2, 0)),
            digest: None,
        };
        let mut fetch_urls = BTreeMap::new();
        fetch_urls.insert(
            "cpython.tar.gz".to_string(),
            "https://example.org/cpython.tar.gz".to_string(),
        );
        let value = manifest_json(&Manifest {
            name: "app",
            description: Some("an app"),
            load_dotenv: true,
            scie_jump: &scie_jump,
            platform: Platform::MacosAarch64,
            interpreter_groups: &[],
            files: &[],
            commands: std::slice::from_ref(&command),
            bindings: std::slice::from_ref(&command),
            fetch_urls: &fetch_urls,
            build_info: None,
        });

        assert_eq!("1.2.0", value["scie"]["jump"]["version"]);
        assert_eq!(
            "https://example.org/cpython.tar.gz",
            value["ptex"]["cpython.tar.gz"]
        );
        assert_eq!("an app", value["scie"]["lift"]["description"]);
        assert_eq!(true, value["scie"]["lift"]["load_dotenv"]);
    }
}
