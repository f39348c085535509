use cairn_crypto::{MasterKey, encrypt_value};
use clap::Args;
use zeroize::Zeroizing;

#[derive(Args, Debug)]
pub struct EncryptArgs {
    /// Key identifier recorded in the envelope, for key rotation.
    #[arg(long)]
    pub kid: Option<String>,
}

pub fn run(args: &EncryptArgs, master_key: Option<&MasterKey>) -> anyhow::Result<()> {
    let master_key = master_key.ok_or_else(|| {
        anyhow::anyhow!("CAIRN_MASTER_KEY environment variable is required for the encrypt command")
    })?;

    let mut plaintext = Zeroizing::new(String::new());
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut plaintext)?;
    let secret = plaintext.trim_end_matches('\n');

    let encrypted = encrypt_value(secret, master_key, args.kid.as_deref())?;
    println!("{encrypted}");
    Ok(())
}
