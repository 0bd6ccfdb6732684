use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Add { url: Option<String> },
    Select { id: String },
    Rename { name: String },
    Delete,
    Set { field: String, value: String },
    Reset,
    Status,
    Connect,
    Schema,
    Login { email: Option<String> },
    Watch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_dir: Option<PathBuf>,
    /// Query string, or a full URL, carrying the `dexie-db` selection.
    pub location: String,
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_dir: None,
            location: String::new(),
            command: Command::Status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    Run,
    HelpRequested,
}

pub fn parse_args_from(
    args: impl IntoIterator<Item = String>,
    cli: &mut CliArgs,
) -> io::Result<ParseOutcome> {
    let mut args = args.into_iter();
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::HelpRequested),
            "--config-dir" => {
                cli.config_dir = Some(PathBuf::from(next_value(&mut args, "--config-dir")?));
            }
            "--url" => cli.location = next_value(&mut args, "--url")?,
            flag if flag.starts_with("--") => {
                return Err(io_other(format!("unknown argument `{flag}`")));
            }
            _ => words.push(arg),
        }
    }

    if !words.is_empty() {
        cli.command = parse_command(words)?;
    }
    Ok(ParseOutcome::Run)
}

fn parse_command(words: Vec<String>) -> io::Result<Command> {
    let mut words = words.into_iter();
    let Some(name) = words.next() else {
        return Ok(Command::Status);
    };

    let command = match name.as_str() {
        "list" => Command::List,
        "add" => Command::Add { url: words.next() },
        "select" => Command::Select {
            id: required(&mut words, "select", "<id>")?,
        },
        "rename" => Command::Rename {
            name: required(&mut words, "rename", "<name>")?,
        },
        "delete" => Command::Delete,
        "set" => Command::Set {
            field: required(&mut words, "set", "<field>")?,
            value: required(&mut words, "set", "<value>")?,
        },
        "reset" => Command::Reset,
        "status" => Command::Status,
        "connect" => Command::Connect,
        "schema" => Command::Schema,
        "login" => Command::Login {
            email: words.next(),
        },
        "watch" => Command::Watch,
        other => return Err(io_other(format!("unknown command `{other}`"))),
    };

    if let Some(extra) = words.next() {
        return Err(io_other(format!("unexpected argument `{extra}` for `{name}`")));
    }
    Ok(command)
}

fn required(
    words: &mut impl Iterator<Item = String>,
    command: &str,
    placeholder: &str,
) -> io::Result<String> {
    words
        .next()
        .ok_or_else(|| io_other(format!("`{command}` requires {placeholder}")))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> io::Result<String> {
    args.next()
        .ok_or_else(|| io_other(format!("missing value for `{flag}`")))
}

pub fn print_help() {
    println!(
        "\
Usage: dxb [--config-dir <path>] [--url <query-or-url>] [command]

Commands:
  list                    Show known databases; `*` marks the selection
  add [database-url]      Add a database and select it
  select <id>             Select a known database
  rename <name>           Rename the selected database
  delete                  Remove the selected database
  set <field> <value>     Update a credential field (camelCase name)
  reset                   Clear the selected database's credentials
  status                  Show the selection and whether it is configured (default)
  connect                 Reconnect with the stored credentials and report the result
  schema                  List tables and primary keys
  login [email]           Refresh tokens through the client-credentials grant
  watch                   Keep a connection open and follow credential changes

Options:
  --config-dir <path>     Directory holding config.toml and storage.json
  --url <query-or-url>    Location whose `dexie-db` parameter picks the database
  -h, --help              Show this help"
    );
}

pub fn io_other(message: impl std::fmt::Display) -> io::Error {
    io::Error::other(message.to_string())
}
