//! Resolution of a lift configuration document into an [`Application`].
//!
//! Resolution is total and one-shot: either every cross-field invariant
//! holds and a fully formed application comes back, or an error naming the
//! offending key, value, or version aborts the whole parse. No partial
//! application is ever observable.

pub mod data;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use semver::Version;

use crate::model::{
    Application, Command, Digest, Env, File, FileSource, FileType, Interpreter, InterpreterGroup,
    Ptex, ScieJump,
};
use crate::platform::Platform;
use crate::providers::{ProviderContext, ProviderRegistry};
use data::Data;

/// The scie-jump release that introduced interpreter group support.
const MIN_GROUPS_JUMP_VERSION: Version = Version::new(0, 11, 0);

/// Parse a configuration file into an application.
pub fn parse_config_file(path: &Path, registry: &ProviderRegistry) -> Result<Application> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
    parse_config_str(&content, &path.display().to_string(), registry)
}

/// Parse configuration content into an application, labelling errors with
/// `source`.
pub fn parse_config_str(
    content: &str,
    source: &str,
    registry: &ProviderRegistry,
) -> Result<Application> {
    let table: toml::Table = toml::from_str(content)
        .with_context(|| format!("Failed to parse TOML from {source}"))?;
    parse_config_data(Data::new(source, table), registry)
}

fn parse_config_data(data: Data, registry: &ProviderRegistry) -> Result<Application> {
    let lift = data.get_data("lift")?;
    let name = lift.get_str("name")?;
    let description = non_empty(lift.get_str_or("description", "")?);
    let load_dotenv = lift.get_bool_or("load_dotenv", false)?;

    let mut platforms = BTreeSet::new();
    for value in lift.get_str_list_or("platforms", &["current"])? {
        let platform = if value == "current" {
            Platform::current()?
        } else {
            Platform::parse(&value)?
        };
        platforms.insert(platform);
    }
    if platforms.is_empty() {
        bail!(
            "There must be at least one platform defined for a lift application. Leave \
             `platforms` un-configured to target just the current platform."
        );
    }

    let scie_jump = match lift.get_data_opt("scie-jump")? {
        Some(table) => ScieJump {
            version: parse_version_field(&table)?,
            digest: parse_digest_field(&table)?,
        },
        None => ScieJump::default(),
    };

    let ptex = match lift.get_data_opt("ptex")? {
        Some(table) => Some(Ptex {
            id: table.get_str_or("id", "ptex")?,
            argv1: table.get_str_or("lazy_argv1", "{scie.lift}")?,
            version: parse_version_field(&table)?,
            digest: parse_digest_field(&table)?,
        }),
        None => None,
    };

    let mut interpreters: IndexMap<String, Interpreter> = IndexMap::new();
    for table in lift.get_data_list_or_empty("interpreters")? {
        let id = table.get_str("id")?;
        if interpreters.contains_key(&id) {
            bail!(
                "The interpreter id '{id}' is declared more than once in {}.",
                table.source()
            );
        }
        let lazy = table.get_bool_or("lazy", false)?;
        let provider_name = table.get_str("provider")?;
        let factory = registry
            .get(&provider_name)
            .ok_or_else(|| anyhow!("The provider '{provider_name}' is not registered."))?;
        let provider = factory(&ProviderContext {
            id: id.clone(),
            lazy,
            config: table.remaining(&["id", "lazy", "provider"]),
        })?;
        interpreters.insert(
            id.clone(),
            Interpreter { id, lazy, provider },
        );
    }

    let mut interpreter_groups = Vec::new();
    for table in lift.get_data_list_or_empty("interpreter_groups")? {
        let id = table.get_str("id")?;
        let selector = table.get_str("selector")?;
        let members = table.get_str_list("members")?;
        if members.len() < 2 {
            let given = match members.first() {
                Some(member) => format!("just '{member}'"),
                None => "none".to_string(),
            };
            bail!(
                "At least two interpreter group members are needed to form an interpreter \
                 group. Given {given} for interpreter group '{id}'."
            );
        }
        for member in &members {
            if !interpreters.contains_key(member) {
                bail!(
                    "Interpreter group '{id}' references interpreter '{member}' which is not \
                     defined in this configuration."
                );
            }
        }
        interpreter_groups.push(InterpreterGroup {
            id,
            selector,
            members,
        });
    }
    if !interpreter_groups.is_empty() {
        if let Some(version) = &scie_jump.version {
            if *version < MIN_GROUPS_JUMP_VERSION {
                bail!(
                    "Cannot use scie-jump {version}.\nThis configuration uses interpreter \
                     groups and these require scie-jump v{MIN_GROUPS_JUMP_VERSION} or greater."
                );
            }
        }
    }

    let mut files = Vec::new();
    for table in lift.get_data_list_or_empty("files")? {
        let name = table.get_str("name")?;
        let file_type = match table.get_str_or("type", "")? {
            value if value.is_empty() => None,
            value => Some(FileType::parse(&value).with_context(|| {
                format!("Invalid {} in {}", table.describe("type"), table.source())
            })?),
        };
        let source = match table.get_str_or("source", "")? {
            value if value.is_empty() => FileSource::Provided,
            value if value == "fetch" => {
                FileSource::Fetch(non_empty(table.get_str_or("url", "")?))
            }
            binding => FileSource::Binding(binding),
        };
        files.push(File {
            name,
            key: non_empty(table.get_str_or("key", "")?),
            digest: parse_digest_field(&table)?,
            file_type,
            executable: table.get_bool_or("executable", false)?,
            eager_extract: table.get_bool_or("eager_extract", false)?,
            source,
        });
    }

    let commands = lift
        .get_data_list("commands")?
        .iter()
        .map(parse_command)
        .collect::<Result<Vec<_>>>()?;
    if commands.is_empty() {
        bail!("There must be at least one command defined in a lift application.");
    }

    let bindings = lift
        .get_data_list_or_empty("bindings")?
        .iter()
        .map(parse_command)
        .collect::<Result<Vec<_>>>()?;

    Ok(Application {
        name,
        description,
        load_dotenv,
        platforms,
        scie_jump,
        ptex,
        interpreters,
        interpreter_groups,
        files,
        commands,
        bindings,
    })
}

fn parse_command(data: &Data) -> Result<Command> {
    let env = match data.get_data_opt("env")? {
        None => Env::default(),
        Some(env_data) => Env {
            default: match env_data.get_data_opt("default")? {
                Some(table) => table.string_map()?,
                None => Default::default(),
            },
            replace: match env_data.get_data_opt("replace")? {
                Some(table) => table.string_map()?,
                None => Default::default(),
            },
            remove_exact: env_data
                .get_str_list_or("remove", &[])?
                .into_iter()
                .collect(),
            remove_re: env_data
                .get_str_list_or("remove_re", &[])?
                .into_iter()
                .collect(),
        },
    };

    Ok(Command {
        // An explicitly empty name or description means "absent".
        name: non_empty(data.get_str_or("name", "")?),
        description: non_empty(data.get_str_or("description", "")?),
        exe: data.get_str("exe")?,
        args: data.get_str_list_or("args", &[])?,
        env,
    })
}

fn parse_version_field(data: &Data) -> Result<Option<Version>> {
    let raw = data.get_str_or("version", "")?;
    if raw.is_empty() {
        return Ok(None);
    }
    parse_lenient_version(&raw)
        .map(Some)
        .with_context(|| format!("Invalid {} in {}", data.describe("version"), data.source()))
}

pub(crate) fn parse_digest_field(data: &Data) -> Result<Option<Digest>> {
    let Some(digest) = data.get_data_opt("digest")? else {
        return Ok(None);
    };
    let size = digest.get_int("size")?;
    let size = u64::try_from(size).map_err(|_| {
        anyhow!(
            "Expected a non-negative size for {} in {} but found {size}.",
            digest.describe("size"),
            digest.source()
        )
    })?;
    Ok(Some(Digest {
        size,
        fingerprint: digest.get_str("fingerprint")?,
    }))
}

/// Parse a version permissively, padding partial versions like "0.11" out
/// to full semver.
fn parse_lenient_version(raw: &str) -> Result<Version> {
    if let Ok(version) = Version::parse(raw) {
        return Ok(version);
    }
    let components = raw.split('.').count();
    let padded = match components {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).with_context(|| format!("Cannot parse version '{raw}'"))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[lift]
name = "echoer"
platforms = ["linux-x86_64"]

[[lift.commands]]
exe = "/bin/echo"
args = ["hi"]
"#;

    fn parse(content: &str) -> Result<Application> {
        parse_config_str(content, "test.toml", &ProviderRegistry::with_builtins())
    }

    #[test]
    fn minimal_application() {
        let app = parse(MINIMAL).unwrap();
        assert_eq!("echoer", app.name);
        assert_eq!(None, app.description);
        assert!(!app.load_dotenv);
        assert_eq!(
            BTreeSet::from([Platform::LinuxX86_64]),
            app.platforms
        );
        assert_eq!(1, app.commands.len());
        assert_eq!("/bin/echo", app.commands[0].exe);
        assert_eq!(vec!["hi".to_string()], app.commands[0].args);
        assert!(app.files.is_empty());
        assert!(app.interpreters.is_empty());
        assert!(app.bindings.is_empty());
        assert_eq!(ScieJump::default(), app.scie_jump);
        assert_eq!(None, app.ptex);
    }

    #[test]
    fn resolution_is_deterministic() {
        let first = parse(MINIMAL).unwrap();
        let second = parse(MINIMAL).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn commands_are_required() {
        let err = parse("[lift]\nname = \"app\"\n").unwrap_err();
        assert!(
            err.to_string().contains("`[lift] commands`"),
            "{err}"
        );

        let err = parse("[lift]\nname = \"app\"\ncommands = []\n").unwrap_err();
        assert!(
            err.to_string().contains("at least one command"),
            "{err}"
        );
    }

    #[test]
    fn empty_platforms_rejected() {
        let err = parse(
            "[lift]\nname = \"app\"\nplatforms = []\n[[lift.commands]]\nexe = \"/bin/true\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one platform"), "{err}");
    }

    #[test]
    fn empty_command_name_normalized_to_absent() {
        let app = parse(
            r#"
[lift]
name = "app"

[[lift.commands]]
name = ""
description = ""
exe = "/bin/true"
"#,
        )
        .unwrap();
        assert_eq!(None, app.commands[0].name);
        assert_eq!(None, app.commands[0].description);
    }

    #[test]
    fn env_tables_resolve_independently() {
        let app = parse(
            r#"
[lift]
name = "app"

[[lift.commands]]
exe = "/bin/true"

[lift.commands.env]
remove = ["PYTHONPATH"]
remove_re = ["^LD_.*"]

[lift.commands.env.default]
LANG = "C"

[lift.commands.env.replace]
HOME = "/tmp"
"#,
        )
        .unwrap();
        let env = &app.commands[0].env;
        assert_eq!(Some(&"C".to_string()), env.default.get("LANG"));
        assert_eq!(Some(&"/tmp".to_string()), env.replace.get("HOME"));
        assert!(env.remove_exact.contains("PYTHONPATH"));
        assert!(env.remove_re.contains("^LD_.*"));
    }

    const INTERPRETER_TABLES: &str = r#"
[[lift.interpreters]]
id = "py312"
provider = "url"
lazy = true

[lift.interpreters.distributions."linux-x86_64"]
url = "https://example.org/cpython-3.12.tar.gz"
size = 1024
fingerprint = "feed"

[[lift.interpreters]]
id = "py313"
provider = "url"
lazy = true

[lift.interpreters.distributions."linux-x86_64"]
url = "https://example.org/cpython-3.13.tar.gz"
size = 2048
fingerprint = "beef"
"#;

    fn with_interpreters(extra: &str) -> String {
        format!(
            "[lift]\nname = \"app\"\nplatforms = [\"linux-x86_64\"]\n{INTERPRETER_TABLES}\n\
             {extra}\n[[lift.commands]]\nexe = \"{{py312}}/bin/python\"\n"
        )
    }

    #[test]
    fn interpreters_resolve_in_declaration_order() {
        let app = parse(&with_interpreters("")).unwrap();
        assert_eq!(
            vec!["py312", "py313"],
            app.interpreters.keys().collect::<Vec<_>>()
        );
        assert!(app.interpreters["py312"].lazy);
    }

    #[test]
    fn unregistered_provider_is_fatal() {
        let err = parse(
            r#"
[lift]
name = "app"

[[lift.interpreters]]
id = "py"
provider = "no-such-provider"

[[lift.commands]]
exe = "/bin/true"
"#,
        )
        .unwrap_err();
        assert_eq!(
            "The provider 'no-such-provider' is not registered.",
            err.to_string()
        );
    }

    #[test]
    fn duplicate_interpreter_ids_rejected() {
        let err = parse(
            r#"
[lift]
name = "app"

[[lift.interpreters]]
id = "py"
provider = "url"

[[lift.interpreters]]
id = "py"
provider = "url"

[[lift.commands]]
exe = "/bin/true"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("'py'"), "{err}");
    }

    #[test]
    fn interpreter_groups_need_two_members() {
        let zero = with_interpreters(
            "[[lift.interpreter_groups]]\nid = \"py\"\nselector = \"{env.PY}\"\nmembers = []\n",
        );
        let err = parse(&zero).unwrap_err();
        assert!(err.to_string().contains("Given none"), "{err}");

        let one = with_interpreters(
            "[[lift.interpreter_groups]]\nid = \"py\"\nselector = \"{env.PY}\"\n\
             members = [\"py312\"]\n",
        );
        let err = parse(&one).unwrap_err();
        assert!(err.to_string().contains("just 'py312'"), "{err}");

        let two = with_interpreters(
            "[[lift.interpreter_groups]]\nid = \"py\"\nselector = \"{env.PY}\"\n\
             members = [\"py312\", \"py313\"]\n",
        );
        let app = parse(&two).unwrap();
        assert_eq!(1, app.interpreter_groups.len());
        assert_eq!(
            vec!["py312", "py313"],
            app.interpreter_groups[0].members
        );
    }

    #[test]
    fn group_members_must_be_declared_interpreters() {
        let config = with_interpreters(
            "[[lift.interpreter_groups]]\nid = \"py\"\nselector = \"{env.PY}\"\n\
             members = [\"py312\", \"pypy\"]\n",
        );
        let err = parse(&config).unwrap_err();
        assert!(err.to_string().contains("'pypy'"), "{err}");
    }

    #[test]
    fn groups_gate_on_scie_jump_version() {
        let old_jump = with_interpreters(
            "[lift.scie-jump]\nversion = \"0.10.0\"\n\
             [[lift.interpreter_groups]]\nid = \"py\"\nselector = \"{env.PY}\"\n\
             members = [\"py312\", \"py313\"]\n",
        );
        let err = parse(&old_jump).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("0.10.0"), "{message}");
        assert!(message.contains("0.11.0"), "{message}");

        let new_jump = old_jump.replace("0.10.0", "0.11.0");
        parse(&new_jump).unwrap();
    }

    #[test]
    fn versions_parse_permissively() {
        assert_eq!(
            Version::new(0, 11, 0),
            parse_lenient_version("0.11").unwrap()
        );
        assert_eq!(Version::new(1, 0, 0), parse_lenient_version("1").unwrap());
        assert_eq!(
            Version::parse("1.2.3-rc.1").unwrap(),
            parse_lenient_version("1.2.3-rc.1").unwrap()
        );
        assert!(parse_lenient_version("not-a-version").is_err());
    }

    #[test]
    fn file_sources_resolve_to_variants() {
        let app = parse(
            r#"
[lift]
name = "app"

[[lift.files]]
name = "config.json"

[[lift.files]]
name = "model.bin"
source = "fetch"
url = "https://example.org/model.bin"

[[lift.files]]
name = "extra.bin"
source = "fetch"

[[lift.files]]
name = "venv"
source = "create-venv"

[[lift.commands]]
exe = "/bin/true"
"#,
        )
        .unwrap();
        assert_eq!(FileSource::Provided, app.files[0].source);
        assert_eq!(
            FileSource::Fetch(Some("https://example.org/model.bin".to_string())),
            app.files[1].source
        );
        assert_eq!(FileSource::Fetch(None), app.files[2].source);
        assert_eq!(
            FileSource::Binding("create-venv".to_string()),
            app.files[3].source
        );
    }

    #[test]
    fn digest_requires_both_fields() {
        let err = parse(
            r#"
[lift]
name = "app"

[[lift.files]]
name = "config.json"

[lift.files.digest]
size = 42

[[lift.commands]]
exe = "/bin/true"
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("fingerprint"),
            "{err}"
        );
    }
}
