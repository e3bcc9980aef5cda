//! NTLMv2 initiator CLI
//!
//! Runs one handshake with hex tokens over stdin/stdout: prints the NEGOTIATE
//! token, reads the server's CHALLENGE token as one hex line, prints the
//! AUTHENTICATE token and the server identity, then signs any `--sign`
//! payloads.

use clap::Parser;
use smb_gss::auth::{Initiator, NtlmConfig, NtlmsspInitiator, Secret, TargetInfoField};
use std::io::{self, BufRead, Write};

#[derive(Parser, Debug)]
#[command(name = "ntlm-initiator")]
#[command(about = "Drive an NTLMv2 security context over hex tokens", long_about = None)]
struct Args {
    /// Username for authentication
    #[arg(short = 'u', long)]
    username: String,

    /// Password for authentication
    #[arg(short = 'P', long, default_value = "", conflicts_with = "nt_hash")]
    password: String,

    /// Precomputed NT hash (32 hex digits) instead of a password
    #[arg(long)]
    nt_hash: Option<String>,

    /// Domain/workgroup
    #[arg(short = 'd', long, default_value = "")]
    domain: String,

    /// Workstation name sent to the server
    #[arg(short = 'w', long, default_value = "RUST-SMB-CLIENT")]
    workstation: String,

    /// Service principal name of the server, e.g. cifs/fs01.corp.example.com
    #[arg(long)]
    spn: Option<String>,

    /// Hex payload to sign once the context is established (repeatable)
    #[arg(long = "sign", value_name = "HEX")]
    sign: Vec<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let secret = match &args.nt_hash {
        Some(hash) => Secret::nt_hash_from_hex(hash)?,
        None => Secret::Password(args.password.clone()),
    };

    let config = NtlmConfig {
        username: args.username.clone(),
        secret,
        domain: args.domain.clone(),
        workstation: args.workstation.clone(),
        target_spn: args.spn.clone(),
    };

    tracing::info!("Authenticating as {}\\{}", args.domain, args.username);
    let mut context = NtlmsspInitiator::with_credentials(config);
    tracing::info!("Mechanism: {}", context.mechanism_id());

    let negotiate = context.init_sec_context()?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", hex::encode(&negotiate))?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let challenge = hex::decode(line.trim())?;

    let authenticate = context.accept_sec_context(&challenge)?;
    writeln!(stdout, "{}", hex::encode(&authenticate))?;

    if let Some(info) = context.target_info() {
        for field in TargetInfoField::ALL {
            let value = info.get(field);
            if !value.is_empty() {
                tracing::info!("{:?}: {}", field, value);
            }
        }
    }

    for payload in &args.sign {
        let message = hex::decode(payload)?;
        let signature = context.sum(&message)?;
        writeln!(stdout, "{}", hex::encode(signature))?;
    }

    tracing::info!("Context established");
    Ok(())
}
