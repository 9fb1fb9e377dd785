use anyhow::{bail, Context};
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use styrene_bus::signature::{self, Token};
use styrene_bus::{
    Arg, BusContext, CodecConfig, Endianness, EndiannessSetting, HeaderChecks, Message,
};

#[derive(Parser, Debug)]
#[command(name = "styrene-busctl")]
struct Cli {
    /// TOML codec configuration.
    #[arg(long)]
    config: Option<String>,

    /// Log verbosity; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Decode a message given as hex or as a path to a binary file.
    Decode {
        input: String,
        /// Skip name grammar checks.
        #[arg(long, default_value_t = false)]
        lenient: bool,
    },
    /// Compose a method call and print its wire image as hex.
    ComposeCall {
        #[arg(long)]
        dest: String,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "")]
        iface: String,
        #[arg(long)]
        member: String,
        #[arg(long, default_value = ":1.1")]
        sender: String,
        /// String arguments, in order.
        #[arg(long = "string")]
        strings: Vec<String>,
        #[arg(long, default_value_t = false)]
        big_endian: bool,
    },
    /// Validate a type signature and list its tokens.
    Signature { sig: String },
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    if let Err(err) = run(cli) {
        eprintln!("styrene-busctl error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => CodecConfig::from_path(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => CodecConfig::default(),
    };
    let mut out = io::stdout().lock();
    match cli.command {
        Command::Decode { input, lenient } => {
            let checks = HeaderChecks::new(config.pedantic && !lenient);
            decode(&input, &checks, &mut out)
        }
        Command::ComposeCall { dest, path, iface, member, sender, strings, big_endian } => {
            let mut config = config;
            if big_endian {
                config.outbound_endianness = EndiannessSetting::Big;
            }
            let context = BusContext::new(&sender, config);
            let args = strings.iter().map(|s| Arg::string(s.as_str())).collect::<Result<Vec<_>, _>>()?;
            let sig = "s".repeat(args.len());
            let message =
                context.compose(context.method_call(&dest, &path, &iface, &member).args(&sig, args))?;
            log::debug!("busctl: composed {message}");
            writeln!(out, "{}", hex::encode(message.as_bytes()))?;
            Ok(())
        }
        Command::Signature { sig } => describe_signature(&sig, &mut out),
    }
}

fn read_input(input: &str) -> anyhow::Result<Vec<u8>> {
    if Path::new(input).is_file() {
        return fs::read(input).with_context(|| format!("reading {input}"));
    }
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).context("input is neither a file nor hex")
}

fn decode(input: &str, checks: &HeaderChecks, out: &mut impl Write) -> anyhow::Result<()> {
    let wire = read_input(input)?;
    let message = Message::from_wire(wire, checks)?;
    let order = match message.endianness() {
        Endianness::Little => "little",
        Endianness::Big => "big",
    };
    writeln!(out, "{message}")?;
    writeln!(out, "  byte order: {order}")?;
    writeln!(out, "  body: {} bytes", message.body_len())?;
    for (id, value) in message.fields().iter() {
        writeln!(out, "  {:<17} {}", id.name(), value)?;
    }
    if message.is_body_encrypted() {
        writeln!(out, "  (body encrypted)")?;
        return Ok(());
    }
    for (i, arg) in message.args()?.iter().enumerate() {
        writeln!(out, "  arg{i} {}: {arg}", arg.signature())?;
    }
    Ok(())
}

fn describe_signature(sig: &str, out: &mut impl Write) -> anyhow::Result<()> {
    signature::validate(sig)?;
    let count = signature::count_complete_types(sig)?;
    if count > styrene_bus::MAX_ARGS {
        bail!("{count} complete types, limit {}", styrene_bus::MAX_ARGS);
    }
    writeln!(out, "{count} complete type(s)")?;
    for ty in signature::complete_types(sig) {
        writeln!(out, "  {}", ty?)?;
    }
    let tokens = signature::tokens(sig)
        .map(|token| {
            token.map(|token| match token {
                Token::Basic(code) => char::from(code).to_string(),
                Token::BeginArray => "array".to_owned(),
                Token::BeginStruct => "struct(".to_owned(),
                Token::EndStruct => ")".to_owned(),
                Token::BeginDictEntry => "entry{".to_owned(),
                Token::EndDictEntry => "}".to_owned(),
                Token::Variant => "variant".to_owned(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    writeln!(out, "tokens: {}", tokens.join(" "))?;
    Ok(())
}
