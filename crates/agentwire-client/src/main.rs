use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use agentwire_core::{AgentContext, SignOptions, SignatureHash};

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    if args.help {
        print_help();
        return Ok(());
    }
    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let socket_path = resolve_socket_path(args.socket_path.clone())?;
    let mut context = AgentContext::open(&socket_path);
    context.init().await?;

    if args.list {
        list_identities(&mut context);
        return Ok(());
    }

    if let Some(comment) = args.sign_comment {
        let key = context
            .identities()
            .and_then(|keys| keys.iter().find(|key| key.comment() == Some(comment.as_str())))
            .cloned()
            .ok_or_else(|| anyhow!("no identity with comment: {comment}"))?;

        let data = match args.sign_path {
            Some(path) => std::fs::read(path)?,
            None => {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            }
        };

        let options = match args.hash {
            Some(hash) => SignOptions::with_hash(hash),
            None => SignOptions::default(),
        };
        let signature = context.sign(&key, &data, options).await?;
        println!("{}", hex::encode(signature));
        return Ok(());
    }

    eprintln!("No command provided. Use --list or --sign.");
    Ok(())
}

fn list_identities(context: &mut AgentContext) {
    while let Some(key) = context.next_key() {
        let comment = key.comment().unwrap_or("-");
        match ssh_key::PublicKey::from_bytes(key.public_blob()) {
            Ok(public_key) => {
                let fingerprint = public_key.fingerprint(ssh_key::HashAlg::Sha256);
                println!("{} {} {}", key.algorithm(), fingerprint, comment);
            }
            Err(_) => {
                println!("{} {} {}", key.algorithm(), hex::encode(key.public_blob()), comment);
            }
        }
    }
}

fn resolve_socket_path(override_path: Option<String>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("AGENTWIRE_SOCK") {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("SSH_AUTH_SOCK") {
        return Ok(PathBuf::from(path));
    }
    Err(anyhow!("no agent socket: pass --socket or set SSH_AUTH_SOCK"))
}

#[derive(Debug, Default)]
struct Args {
    socket_path: Option<String>,
    list: bool,
    sign_comment: Option<String>,
    sign_path: Option<String>,
    hash: Option<SignatureHash>,
    help: bool,
    version: bool,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => parsed.socket_path = args.next(),
            "--list" => parsed.list = true,
            "--sign" => parsed.sign_comment = args.next(),
            "--data" => parsed.sign_path = args.next(),
            "--hash" => {
                parsed.hash = args.next().as_deref().and_then(parse_hash);
            }
            "-h" | "--help" => parsed.help = true,
            "--version" => parsed.version = true,
            _ => {}
        }
    }

    parsed
}

fn parse_hash(value: &str) -> Option<SignatureHash> {
    if value.eq_ignore_ascii_case("sha256") || value.eq_ignore_ascii_case("rsa-sha2-256") {
        return Some(SignatureHash::Sha256);
    }
    if value.eq_ignore_ascii_case("sha512") || value.eq_ignore_ascii_case("rsa-sha2-512") {
        return Some(SignatureHash::Sha512);
    }
    None
}

fn print_help() {
    println!("agentwire-client usage:\n");
    println!("  --list");
    println!("  --sign <comment> [--data <path>] [--hash sha256|sha512]");
    println!("  --socket <path>\n");
    println!("  --version\n");
    println!("Notes:");
    println!("  If --data is omitted, stdin is used for signing.");
    println!("  The socket falls back to AGENTWIRE_SOCK, then SSH_AUTH_SOCK.");
}
