//! Demo harness: drives a [`mongocrypt_ctx::Context`] against an in-memory
//! fake key vault and a fake KMS responder loop, standing in for the
//! out-of-process collaborators the core itself never talks to directly.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use bson::{doc, Bson, Document};
use clap::{Parser, Subcommand};
use crypto_facade::{AeadCryptoProvider, CryptoProvider};
use key_broker::{KeyDocument, KeyRef as BrokerKeyRef};
use mongocrypt_ctx::{AnyKmsContext, Context, DataKeyContext, DecryptContext, EncryptContext, SharedStores, State};
use uuid::Uuid;

/// A stand-in master key, as if held by an external KMS; this CLI never
/// talks to a real one.
const DEMO_MASTER_KEY: [u8; 32] = [0x42; 32];

#[derive(Parser, Debug)]
#[command(name = "mongocrypt-cli", about = "Demo driver for the field-level encryption context state machine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a data key against the fake KMS and print the key-vault
    /// document that would be inserted.
    CreateDataKey {
        #[arg(long)]
        key_alt_name: Option<String>,
    },
    /// Create a data key, explicitly encrypt a value under it, then decrypt
    /// it back, printing every stage.
    Demo {
        #[arg(long, default_value = "hunter2")]
        value: String,
    },
}

fn main() -> Result<()> {
    telemetry::init_json_logging().ok();
    let cli = Cli::parse();

    let crypto: Arc<dyn CryptoProvider> = Arc::new(AeadCryptoProvider);
    let shared = SharedStores::new(Arc::clone(&crypto));

    match cli.cmd {
        Command::CreateDataKey { key_alt_name } => {
            let alt_names = key_alt_name.map(|n| vec![Bson::String(n)]).unwrap_or_default();
            let mut ctx = DataKeyContext::init(fle_core::next_context_id(), shared, doc! { "provider": "demo" }, alt_names)?;
            let key_doc = run_data_key(&mut ctx, crypto.as_ref())?;
            println!("{key_doc:#?}");
        }
        Command::Demo { value } => run_demo(&shared, crypto.as_ref(), &value)?,
    }
    Ok(())
}

fn run_demo(shared: &SharedStores, crypto: &dyn CryptoProvider, value: &str) -> Result<()> {
    let mut dk_ctx = DataKeyContext::init(
        fle_core::next_context_id(),
        shared.clone(),
        doc! { "provider": "demo" },
        vec![Bson::String("demo-key".to_string())],
    )?;
    let key_doc = run_data_key(&mut dk_ctx, crypto)?;
    let key_id = binary_field(&key_doc, "_id").and_then(|b| Uuid::from_slice(b).map_err(anyhow::Error::from))?;
    let wrapped_material = binary_field(&key_doc, "keyMaterial")?.to_vec();
    println!("created data key {key_id}");

    let mut vault = HashMap::new();
    vault.insert(key_id, KeyDocument { key_id, key_alt_names: vec![], encrypted_key_material: wrapped_material });

    let encrypt_ctx = EncryptContext::init_explicit(
        fle_core::next_context_id(),
        shared.clone(),
        doc! { "v": value },
        fle_core::KeyRef::Id(key_id),
        fle_core::Algorithm::Random,
        None,
        false,
    )?;
    let mut ctx = Context::Encrypt(encrypt_ctx);
    let encrypted = drive_keys_and_kms(&mut ctx, &vault, crypto)?;
    println!("encrypted: {encrypted:#?}");

    let decrypt_ctx = DecryptContext::init_explicit(fle_core::next_context_id(), shared.clone(), encrypted, false)?;
    let mut ctx = Context::Decrypt(decrypt_ctx);
    let decrypted = drive_keys_and_kms(&mut ctx, &vault, crypto)?;
    println!("decrypted: {decrypted:#?}");

    let roundtripped = decrypted.get_str("v").map_err(|e| anyhow::anyhow!("{e}"))?;
    ensure!(roundtripped == value, "round trip mismatch: expected {value:?}, got {roundtripped:?}");
    println!("round trip OK");
    println!("cache metrics: {:?}", shared.cache_metrics.snapshot());
    println!("broker metrics: {:?}", shared.broker_metrics.snapshot());
    Ok(())
}

fn binary_field<'a>(doc: &'a Document, field: &str) -> Result<&'a [u8]> {
    match doc.get(field) {
        Some(Bson::Binary(bin)) => Ok(bin.bytes.as_slice()),
        _ => bail!("expected {field} to be a binary field"),
    }
}

/// Drive a data-key context's single KMS wrap to completion.
fn run_data_key(ctx: &mut DataKeyContext, crypto: &dyn CryptoProvider) -> Result<Document> {
    loop {
        match ctx.state() {
            State::NeedKms => {
                if let Some(kms) = ctx.next_kms_ctx() {
                    let wrapped = crypto.encrypt(&DEMO_MASTER_KEY, fle_core::Algorithm::Random, None, &kms.plaintext_key_material)?;
                    ctx.kms_done(Ok(wrapped));
                }
            }
            State::Ready => {
                let mut out = Document::new();
                ctx.finalize(&mut out);
                return Ok(out);
            }
            State::Error => bail!("data key context failed: {:?}", ctx.status()),
            other => bail!("unexpected data-key state {other:?}"),
        }
    }
}

/// Drive an encrypt or decrypt context through key-vault lookup, KMS
/// unwrapping, and finalize.
fn drive_keys_and_kms(ctx: &mut Context, vault: &HashMap<Uuid, KeyDocument>, crypto: &dyn CryptoProvider) -> Result<Document> {
    loop {
        match ctx.state() {
            State::NeedMongoKeys => {
                let mut wanted = Vec::new();
                ctx.mongo_op_keys(&mut wanted);
                let docs: Vec<KeyDocument> = wanted
                    .iter()
                    .filter_map(|key_ref| match key_ref {
                        BrokerKeyRef::Id(id) => vault.get(id).cloned(),
                        BrokerKeyRef::AltName(_) => None,
                    })
                    .collect();
                ctx.mongo_feed_keys(&docs);
                ctx.mongo_done_keys();
            }
            State::NeedKms => {
                if let Some(kms_ctx) = ctx.next_kms_ctx() {
                    match &kms_ctx {
                        AnyKmsContext::KeyBroker(k) => {
                            let material = crypto.decrypt(&DEMO_MASTER_KEY, fle_core::Algorithm::Random, &k.encrypted_key_material)?;
                            ctx.kms_done(&kms_ctx, Ok(material));
                        }
                        AnyKmsContext::DataKey(_) => bail!("unexpected data-key kms context on an encrypt/decrypt context"),
                    }
                }
            }
            State::Ready => {
                let mut out = Document::new();
                ctx.finalize(&mut out);
                return Ok(out);
            }
            State::Error => bail!("context failed: {:?}", ctx.status()),
            other => bail!("unexpected state {other:?} for an explicit context"),
        }
    }
}
