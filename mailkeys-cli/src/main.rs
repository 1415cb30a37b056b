use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use mailkeys_core::{KeyPreset, PassphraseProvider, VerifyResult, sanitize_for_terminal};
use mailkeys_engine::blocks::detect_blocks;
use mailkeys_engine::msg::{
    DecryptOptions, DecryptResult, EncryptOptions, PrvKeyInfo, decrypt_message, encrypt_message,
    recipient_longids, sign, verify_detached,
};
use mailkeys_engine::pgp::{self, KeyGenOptions};
use mailkeys_engine::{Key, armor_key, decrypt_key, diagnose, parse, parse_pkcs12, read_many};
use std::fs;
use std::io::{self, Read, Write};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mailkeys",
    version,
    about = "Inspect, diagnose and exercise OpenPGP and S/MIME keys and messages"
)]
struct Cli {
    #[arg(
        long = "passphrase",
        global = true,
        value_name = "PASS",
        help = "Unsafe passphrase via argv (requires --allow-unsafe-passphrase)",
        long_help = "Provide a passphrase directly on the command line (unsafe: leaks via shell history and process listings). Requires --allow-unsafe-passphrase. Prefer --passphrase-file."
    )]
    passphrase: Option<String>,

    #[arg(
        long = "passphrase-file",
        global = true,
        value_name = "FILE",
        help = "Read passphrase from file (recommended)"
    )]
    passphrase_file: Option<String>,

    #[arg(
        long = "allow-unsafe-passphrase",
        global = true,
        help = "Allow using --passphrase (unsafe)"
    )]
    allow_unsafe_passphrase: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the derived properties of every key in the input.
    #[command(alias = "ls")]
    Inspect {
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
        /// Treat the input as a PKCS#12 bundle unlocked with the passphrase.
        #[arg(long)]
        pkcs12: bool,
    },
    /// Run the support checklist against a single key.
    Diagnose {
        #[arg(value_name = "KEYFILE")]
        key: String,
        #[arg(long)]
        pkcs12: bool,
    },
    #[command(alias = "gen")]
    Keygen {
        #[arg(value_name = "USER_ID", required = true, num_args = 1..)]
        user_ids: Vec<String>,
        /// curve25519, rsa2048 or rsa4096.
        #[arg(long, default_value = "curve25519")]
        preset: KeyPreset,
        #[arg(long = "expire-days", value_name = "DAYS", default_value_t = 0)]
        expire_days: u64,
        #[arg(long = "no-passphrase")]
        no_passphrase: bool,
        /// Armored private key destination.
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
        #[arg(long = "public-out", value_name = "FILE")]
        public_out: Option<String>,
        #[arg(long = "revocation-out", value_name = "FILE")]
        revocation_out: Option<String>,
    },
    /// Emit a revocation certificate, or merge one into the key with --apply.
    Revoke {
        #[arg(value_name = "KEYFILE")]
        key: String,
        #[arg(long, value_name = "REVFILE")]
        apply: Option<String>,
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
    },
    #[command(alias = "enc")]
    Encrypt {
        #[arg(
            short = 'r',
            long = "recipient",
            value_name = "KEYFILE",
            required = true
        )]
        recipients: Vec<String>,
        #[arg(long = "sign-with", value_name = "KEYFILE")]
        sign_with: Option<String>,
        #[arg(short = 'a', long)]
        armor: bool,
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
    },
    #[command(alias = "dec")]
    Decrypt {
        #[arg(short = 'k', long = "key", value_name = "KEYFILE", required = true)]
        keys: Vec<String>,
        #[arg(long = "verify-with", value_name = "KEYFILE")]
        verify_with: Vec<String>,
        #[arg(
            long = "allow-revoked-keys",
            help = "Allow decrypting using revoked keys (useful for archival recovery)"
        )]
        allow_revoked_keys: bool,
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
    },
    /// List the key ids a message is encrypted for.
    Recipients {
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
    },
    #[command(alias = "sig")]
    Sign {
        #[arg(short = 'k', long = "key", value_name = "KEYFILE")]
        key: String,
        #[arg(long)]
        clearsign: bool,
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
    },
    #[command(alias = "ver")]
    Verify {
        #[arg(long = "sig", value_name = "SIGFILE")]
        sig: String,
        #[arg(short = 'k', long = "key", value_name = "KEYFILE", required = true)]
        keys: Vec<String>,
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
        #[arg(long)]
        signer: Option<String>,
    },
    /// Split text into plain and armored blocks.
    Blocks {
        #[arg(long, alias = "in")]
        input: Option<String>,
        #[arg(value_name = "FILE", index = 1)]
        input_file: Option<String>,
    },
}

/// The single passphrase given on the command line, offered for every key.
struct CliPassphrase(Option<String>);

impl PassphraseProvider for CliPassphrase {
    fn passphrase_for(&self, _key_id: &str) -> Option<String> {
        self.0.clone()
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if cli.passphrase.is_some() && !cli.allow_unsafe_passphrase {
        return Err(anyhow!(
            "--passphrase is unsafe (leaks via shell history / process listings); use --passphrase-file, or pass --allow-unsafe-passphrase to proceed"
        ));
    }

    if cli.passphrase.is_some() {
        warn!("--passphrase can expose secrets in process listings (allowed)");
    }

    if cli.passphrase.is_some() && cli.passphrase_file.is_some() {
        warn!("both --passphrase and --passphrase-file set; using file");
    }

    let passphrase = if let Some(path) = &cli.passphrase_file {
        Some(read_passphrase_file(path)?)
    } else {
        cli.passphrase.clone()
    };

    match cli.cmd {
        Command::Inspect {
            input,
            input_file,
            pkcs12,
        } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let bytes = read_input(input)?;
            let keys = if pkcs12 {
                let passphrase = passphrase
                    .as_deref()
                    .ok_or_else(|| anyhow!("--pkcs12 requires --passphrase-file"))?;
                vec![parse_pkcs12(&bytes, passphrase)?]
            } else {
                let result = read_many(&bytes);
                for err in &result.errors {
                    eprintln!("skipped: {}", sanitize_for_terminal(&err.to_string()));
                }
                result.keys
            };
            if keys.is_empty() {
                return Err(anyhow!("no keys found"));
            }
            for key in &keys {
                print!("{}", describe_key(key));
            }
            Ok(())
        }
        Command::Diagnose { key, pkcs12 } => {
            let bytes = read_input(Some(key))?;
            let key = if pkcs12 {
                let passphrase = passphrase
                    .as_deref()
                    .ok_or_else(|| anyhow!("--pkcs12 requires --passphrase-file"))?;
                parse_pkcs12(&bytes, passphrase)?
            } else {
                parse(&bytes)?
            };
            let report = diagnose(&key, passphrase.as_deref());
            for (name, value) in report.entries() {
                println!("{name}: {}", sanitize_for_terminal(value));
            }
            Ok(())
        }
        Command::Keygen {
            user_ids,
            preset,
            expire_days,
            no_passphrase,
            output,
            public_out,
            revocation_out,
        } => {
            if passphrase.is_none() && !no_passphrase {
                return Err(anyhow!(
                    "passphrase required for key generation; use --passphrase/--passphrase-file or --no-passphrase"
                ));
            }
            let generated = pgp::create(&KeyGenOptions {
                user_ids,
                preset,
                passphrase: if no_passphrase { None } else { passphrase },
                expire_seconds: expire_days.saturating_mul(86_400),
            })?;
            if let Some(path) = public_out {
                write_output(Some(path), generated.public.as_bytes())?;
            }
            if let Some(path) = revocation_out {
                write_output(Some(path), generated.revocation_certificate.as_bytes())?;
            }
            let to_stdout = output.is_none();
            write_output(output, generated.private.as_bytes())?;
            if !to_stdout {
                println!("created key: {}", generated.key.id());
            }
            Ok(())
        }
        Command::Revoke { key, apply, output } => {
            let key = load_key(&key)?;
            let armored = match apply {
                Some(path) => {
                    let revocation = String::from_utf8(read_input(Some(path))?)
                        .map_err(|_| anyhow!("revocation certificate must be armored text"))?;
                    let revoked = pgp::apply_revocation_certificate(&key, &revocation)?;
                    armor_key(&revoked.to_public()?)?
                }
                None => {
                    let key = unlock(key, passphrase.as_deref())?;
                    pgp::get_or_create_revocation_certificate(&key)?
                }
            };
            write_output(output, armored.as_bytes())
        }
        Command::Encrypt {
            recipients,
            sign_with,
            armor,
            input,
            output,
            input_file,
        } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let pubkeys = load_keys(&recipients)?;
            let signing_key = match sign_with {
                Some(path) => Some(unlock(load_key(&path)?, passphrase.as_deref())?),
                None => None,
            };
            let data = read_input(input)?;
            let encrypted = encrypt_message(&EncryptOptions {
                pubkeys: &pubkeys,
                data: &data,
                armor,
                signing_key: signing_key.as_ref(),
            })?;
            let bytes = match (encrypted.openpgp, encrypted.smime) {
                (Some(openpgp), None) => openpgp,
                (None, Some(smime)) => smime,
                // Both armorings are text and can sit side by side.
                (Some(mut openpgp), Some(smime)) if armor => {
                    openpgp.extend_from_slice(&smime);
                    openpgp
                }
                (Some(_), Some(_)) => {
                    return Err(anyhow!(
                        "recipients span OpenPGP and S/MIME; use --armor to write both messages"
                    ));
                }
                (None, None) => return Err(anyhow!("nothing was encrypted")),
            };
            write_output(output, &bytes)
        }
        Command::Decrypt {
            keys,
            verify_with,
            allow_revoked_keys,
            input,
            output,
            input_file,
        } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let keys: Vec<PrvKeyInfo> = load_keys(&keys)?
                .into_iter()
                .map(|key| PrvKeyInfo {
                    key,
                    passphrase: None,
                })
                .collect();
            let verification_pubs = load_keys(&verify_with)?;
            let encrypted = read_input(input)?;
            let provider = CliPassphrase(passphrase);
            let result = decrypt_message(&DecryptOptions {
                keys: &keys,
                encrypted_data: &encrypted,
                verification_pubs: &verification_pubs,
                passphrases: Some(&provider),
                allow_revoked_keys,
            });
            match result {
                DecryptResult::Success(success) => {
                    if let Some(signature) = &success.signature {
                        eprintln!("{}", describe_signature(signature));
                    }
                    write_output(output, &success.content)
                }
                DecryptResult::Error(err) => {
                    debug!(longids = ?err.longids, "decrypt failed");
                    if !err.longids.need_passphrase.is_empty() {
                        eprintln!(
                            "need passphrase for: {}",
                            err.longids.need_passphrase.join(", ")
                        );
                    }
                    if !err.longids.message.is_empty() {
                        eprintln!("encrypted for: {}", err.longids.message.join(", "));
                    }
                    Err(anyhow!("{}: {}", err.kind, err.message))
                }
            }
        }
        Command::Recipients { input, input_file } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let bytes = read_input(input)?;
            for longid in recipient_longids(&bytes)? {
                println!("{longid}");
            }
            Ok(())
        }
        Command::Sign {
            key,
            clearsign,
            input,
            output,
            input_file,
        } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let key = unlock(load_key(&key)?, passphrase.as_deref())?;
            let data = read_input(input)?;
            let signed = sign(&key, &data, !clearsign)?;
            write_output(output, signed.as_bytes())
        }
        Command::Verify {
            sig,
            keys,
            input,
            input_file,
            signer,
        } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let expected = signer.as_deref().map(normalize_fingerprint).transpose()?;
            let pubkeys = load_keys(&keys)?;
            let signature = read_input(Some(sig))?;
            let data = read_input(input)?;
            let result = verify_detached(&data, &signature, &pubkeys);
            println!("{}", describe_signature(&result));
            if result.matched == Some(true) {
                enforce_expected_signer(expected.as_deref(), &result)
            } else {
                Err(anyhow!("signature not verified"))
            }
        }
        Command::Blocks { input, input_file } => {
            let input = merge_arg("input", input, input_file, "--input", "FILE")?;
            let bytes = read_input(input)?;
            let text = String::from_utf8_lossy(&bytes);
            for block in detect_blocks(&text).blocks {
                println!(
                    "{} {}..{}",
                    block.kind.as_str(),
                    block.range.start,
                    block.range.end
                );
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MAILKEYS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn describe_key(key: &Key) -> String {
    let info = key.info();
    let mut out = String::new();
    let kind = if info.is_private { "sec" } else { "pub" };
    out.push_str(&format!("{kind} | {} | {} | {}\n", info.id, info.family, info.algo));
    out.push_str(&format!("  created: {}\n", info.created));
    match info.expiration {
        Some(expiration) => out.push_str(&format!("  expires: {expiration}\n")),
        None => out.push_str("  expires: never\n"),
    }
    let mut flags = Vec::new();
    if info.revoked {
        flags.push("revoked");
    }
    if info.usable_for_encryption {
        flags.push("encrypt");
    } else if info.usable_for_encryption_but_expired {
        flags.push("encrypt-expired");
    }
    if info.usable_for_signing {
        flags.push("sign");
    } else if info.usable_for_signing_but_expired {
        flags.push("sign-expired");
    }
    if info.is_private {
        flags.push(if info.fully_decrypted {
            "unlocked"
        } else {
            "locked"
        });
    }
    out.push_str(&format!("  flags: {}\n", flags.join(",")));
    for identity in &info.identities {
        let mut marks = Vec::new();
        if identity.primary {
            marks.push("primary");
        }
        if !identity.valid {
            marks.push("invalid");
        }
        if identity.revoked {
            marks.push("revoked");
        }
        let suffix = if marks.is_empty() {
            String::new()
        } else {
            format!(" [{}]", marks.join(","))
        };
        out.push_str(&format!(
            "  uid: {}{suffix}\n",
            sanitize_for_terminal(&identity.user_id)
        ));
    }
    for email in &info.emails {
        out.push_str(&format!("  email: {}\n", sanitize_for_terminal(email)));
    }
    out
}

fn describe_signature(result: &VerifyResult) -> String {
    let signers = if result.signer_longids.is_empty() {
        "unknown".to_string()
    } else {
        result.signer_longids.join(", ")
    };
    match result.matched {
        Some(true) => format!(
            "good signature from {}",
            result.signer_fingerprint.as_deref().unwrap_or(&signers)
        ),
        Some(false) => format!(
            "bad signature from {signers}: {}",
            sanitize_for_terminal(result.error.as_deref().unwrap_or("verification failed"))
        ),
        None if result.is_err_fatal => format!(
            "malformed signature: {}",
            sanitize_for_terminal(result.error.as_deref().unwrap_or("unreadable"))
        ),
        None => format!("signer key not supplied: {signers}"),
    }
}

fn load_key(path: &str) -> Result<Key> {
    Ok(parse(&read_input(Some(path.to_string()))?)?)
}

/// Every key found in `paths`; any unreadable key fails the whole load.
fn load_keys(paths: &[String]) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    for path in paths {
        let result = read_many(&read_input(Some(path.clone()))?);
        if let Some(err) = result.errors.into_iter().next() {
            return Err(anyhow!("{path}: {err}"));
        }
        if result.keys.is_empty() {
            return Err(anyhow!("{path}: no keys found"));
        }
        keys.extend(result.keys);
    }
    Ok(keys)
}

fn unlock(mut key: Key, passphrase: Option<&str>) -> Result<Key> {
    if !key.is_private() || key.fully_decrypted() {
        return Ok(key);
    }
    let passphrase = passphrase.ok_or_else(|| {
        anyhow!(
            "key {} is locked; use --passphrase-file or --passphrase",
            key.id()
        )
    })?;
    if !decrypt_key(&mut key, passphrase)? {
        return Err(anyhow!("incorrect passphrase for key {}", key.id()));
    }
    Ok(key)
}

fn read_input(path: Option<String>) -> Result<Vec<u8>> {
    let limit = max_input_bytes()?;
    match path {
        Some(path) if path == "-" => read_to_end_limited(io::stdin(), limit),
        Some(path) => {
            let metadata = fs::metadata(&path)?;
            if metadata.len() > limit as u64 {
                return Err(anyhow!(
                    "input exceeds size limit ({limit} bytes); set MAILKEYS_MAX_INPUT_BYTES to override"
                ));
            }
            Ok(fs::read(path)?)
        }
        None => read_to_end_limited(io::stdin(), limit),
    }
}

fn read_passphrase_file(path: &str) -> Result<String> {
    const MAX_PASSPHRASE_FILE_BYTES: u64 = 16 * 1024;

    let link_meta = fs::symlink_metadata(path)?;
    if link_meta.file_type().is_symlink() {
        return Err(anyhow!("passphrase file must not be a symlink"));
    }
    let file = fs::File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(anyhow!("passphrase file must be a regular file"));
    }
    if meta.len() > MAX_PASSPHRASE_FILE_BYTES {
        return Err(anyhow!(
            "passphrase file exceeds size limit ({} bytes; max {} bytes)",
            meta.len(),
            MAX_PASSPHRASE_FILE_BYTES
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = meta.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(anyhow!(
                "passphrase file permissions too broad (mode {:04o}); require 0400/0600 (no group/other access)",
                mode
            ));
        }
    }

    let bytes = read_to_end_limited(file, MAX_PASSPHRASE_FILE_BYTES as usize)?;
    let mut passphrase = String::from_utf8(bytes)
        .map_err(|err| anyhow!("passphrase file must be valid UTF-8: {err}"))?;
    while passphrase.ends_with('\n') || passphrase.ends_with('\r') {
        passphrase.pop();
    }
    Ok(passphrase)
}

fn write_output(path: Option<String>, bytes: &[u8]) -> Result<()> {
    match path {
        Some(path) => write_file_secure(&path, bytes),
        None => {
            let mut stdout = io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn merge_arg(
    label: &str,
    primary: Option<String>,
    secondary: Option<String>,
    primary_name: &str,
    secondary_name: &str,
) -> Result<Option<String>> {
    if primary.is_some() && secondary.is_some() {
        return Err(anyhow!(
            "use either {primary_name} or {secondary_name} for {label}"
        ));
    }
    Ok(primary.or(secondary))
}

fn max_input_bytes() -> Result<usize> {
    const DEFAULT_LIMIT: usize = 64 * 1024 * 1024;
    match std::env::var("MAILKEYS_MAX_INPUT_BYTES") {
        Ok(value) => value
            .parse::<usize>()
            .map_err(|err| anyhow!("invalid MAILKEYS_MAX_INPUT_BYTES value {value:?}: {err}")),
        Err(_) => Ok(DEFAULT_LIMIT),
    }
}

fn read_to_end_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        if buf.len() + read > limit {
            return Err(anyhow!(
                "input exceeds size limit ({limit} bytes); set MAILKEYS_MAX_INPUT_BYTES to override"
            ));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    Ok(buf)
}

/// Writes through a temp file in the destination directory and renames it
/// into place with mode 0600. Private keys pass through here.
fn write_file_secure(path: &str, bytes: &[u8]) -> Result<()> {
    use std::path::Path;

    let dest = Path::new(path);
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.file_type().is_symlink() {
            return Err(anyhow!(
                "refusing to write to symlink path: {}",
                dest.display()
            ));
        }
        if !meta.file_type().is_file() {
            return Err(anyhow!(
                "refusing to write to non-regular file path: {}",
                dest.display()
            ));
        }
    }

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)
        .map_err(|e| anyhow!("persist failed: {}", e.error))?;
    Ok(())
}

fn normalize_fingerprint(value: &str) -> Result<String> {
    let normalized = value
        .trim()
        .trim_start_matches("0x")
        .replace([' ', '\t', ':'], "")
        .to_uppercase();
    let len = normalized.len();
    if (len != 40 && len != 64) || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "fingerprint must be 40 or 64 hex characters (got {len})"
        ));
    }
    Ok(normalized)
}

fn enforce_expected_signer(expected: Option<&str>, result: &VerifyResult) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = result
        .signer_fingerprint
        .as_deref()
        .ok_or_else(|| anyhow!("signature does not include signer fingerprint"))?;
    let actual = normalize_fingerprint(actual)
        .map_err(|_| anyhow!("signature does not include full fingerprint"))?;
    if actual == expected {
        Ok(())
    } else {
        Err(anyhow!("signature made by {actual}, expected {expected}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().to_string()
    }

    #[test]
    fn keygen_preset_goes_through_key_preset_parser() {
        let cli = Cli::try_parse_from([
            "mailkeys",
            "keygen",
            "a <a@example.com>",
            "--preset",
            "RSA4k",
        ])
        .expect("parse");
        let Command::Keygen { preset, .. } = cli.cmd else {
            panic!("expected keygen");
        };
        assert_eq!(preset, KeyPreset::Rsa4096);

        let cli = Cli::try_parse_from(["mailkeys", "keygen", "a <a@example.com>"]).expect("parse");
        let Command::Keygen { preset, .. } = cli.cmd else {
            panic!("expected keygen");
        };
        assert_eq!(preset, KeyPreset::Curve25519);

        let err = Cli::try_parse_from([
            "mailkeys",
            "keygen",
            "a <a@example.com>",
            "--preset",
            "dsa",
        ])
        .expect_err("unknown preset");
        assert!(err.to_string().contains("unknown key preset"));
    }

    #[test]
    fn normalize_fingerprint_accepts_valid_inputs() {
        let short = "0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let normalized = normalize_fingerprint(short).expect("normalize");
        assert_eq!(normalized, "DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF");

        let spaced = "ab cd ef 12 34 56 78 90 ab cd ef 12 34 56 78 90 ab cd ef 12";
        let normalized = normalize_fingerprint(spaced).expect("normalize");
        assert_eq!(normalized, "ABCDEF1234567890ABCDEF1234567890ABCDEF12");
    }

    #[test]
    fn normalize_fingerprint_rejects_invalid_inputs() {
        let err = normalize_fingerprint("not-hex").expect_err("invalid");
        assert!(err.to_string().contains("fingerprint must be 40 or 64"));

        let err = normalize_fingerprint("abcd").expect_err("invalid");
        assert!(err.to_string().contains("fingerprint must be 40 or 64"));
    }

    #[test]
    fn merge_arg_enforces_exclusive_args() {
        let err = merge_arg("input", Some("a".into()), Some("b".into()), "--in", "FILE")
            .expect_err("expected conflict");
        assert!(err.to_string().contains("use either"));

        let merged = merge_arg("input", Some("a".into()), None, "--in", "FILE").expect("merge");
        assert_eq!(merged.as_deref(), Some("a"));
    }

    #[test]
    fn read_to_end_limited_enforces_limit() {
        let data = vec![1u8; 10];
        let err = read_to_end_limited(Cursor::new(&data), 5).expect_err("expected limit error");
        assert!(err.to_string().contains("input exceeds size limit"));

        let ok = read_to_end_limited(Cursor::new(&data), 20).expect("read");
        assert_eq!(ok, data);
    }

    #[test]
    fn read_passphrase_file_trims_newlines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = temp_path(&dir, "passphrase");
        fs::write(&path, b"secret\r\n").expect("write passphrase");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");
        }
        assert_eq!(read_passphrase_file(&path).expect("read"), "secret");
    }

    #[test]
    fn read_passphrase_file_rejects_non_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_passphrase_file(&dir.path().to_string_lossy())
            .expect_err("expected file type error");
        assert!(err.to_string().contains("regular file"), "unexpected: {err}");
    }

    #[test]
    #[cfg(unix)]
    fn read_passphrase_file_rejects_broad_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = temp_path(&dir, "passphrase-broad");
        fs::write(&path, b"secret\n").expect("write passphrase");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let err = read_passphrase_file(&path).expect_err("expected perms error");
        assert!(err.to_string().contains("permissions too broad"));
    }

    #[test]
    #[cfg(unix)]
    fn write_file_secure_overwrites_with_strict_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = temp_path(&dir, "out");
        fs::write(&path, b"old").expect("write existing");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        write_file_secure(&path, b"new").expect("write");

        assert_eq!(fs::read(&path).expect("read"), b"new");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    #[cfg(unix)]
    fn write_file_secure_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = temp_path(&dir, "target");
        let link = temp_path(&dir, "link");
        fs::write(&target, b"t").expect("write target");
        symlink(&target, &link).expect("symlink");

        let err = write_file_secure(&link, b"secret").expect_err("expected symlink error");
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn enforce_expected_signer_checks_identity() {
        let result = VerifyResult {
            matched: Some(true),
            signer_fingerprint: Some("DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF".into()),
            ..VerifyResult::default()
        };
        enforce_expected_signer(Some("DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF"), &result)
            .expect("expected match");
        enforce_expected_signer(None, &result).expect("no expectation");

        let err =
            enforce_expected_signer(Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"), &result)
                .expect_err("expected mismatch");
        assert!(err.to_string().contains("expected"));

        let anonymous = VerifyResult {
            matched: Some(true),
            ..VerifyResult::default()
        };
        let err =
            enforce_expected_signer(Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"), &anonymous)
                .expect_err("expected missing fingerprint");
        assert!(err.to_string().contains("signer fingerprint"));
    }

    #[test]
    fn signature_descriptions_cover_every_outcome() {
        let good = VerifyResult {
            matched: Some(true),
            signer_fingerprint: Some("ABCD".into()),
            ..VerifyResult::default()
        };
        assert_eq!(describe_signature(&good), "good signature from ABCD");

        let missing = VerifyResult {
            signer_longids: vec!["0011223344556677".into()],
            ..VerifyResult::default()
        };
        assert_eq!(
            describe_signature(&missing),
            "signer key not supplied: 0011223344556677"
        );

        let bad = VerifyResult {
            matched: Some(false),
            error: Some("bad\x1b[31m".into()),
            ..VerifyResult::default()
        };
        assert!(describe_signature(&bad).contains("\\x1B"));

        assert!(describe_signature(&VerifyResult::fatal("junk")).starts_with("malformed"));
    }
}
