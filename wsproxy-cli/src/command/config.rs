use anyhow::Result;

use super::serve::ServerArgs;
use crate::config::Config;

/// Print the effective server configuration
#[derive(Debug, clap::Args)]
pub struct Args {
    #[command(flatten)]
    server: ServerArgs,

    /// Print the password instead of masking it
    #[arg(long)]
    show_password: bool,
}

pub fn execute(args: &Args) -> Result<()> {
    let mut config = args.server.resolve()?;
    if !args.show_password {
        config.password = config.password.map(|_| "********".to_string());
    }

    match Config::user_path() {
        Some(path) => println!("# user config: {}", path.display()),
        None => println!("# user config: unavailable"),
    }
    print!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
