pub mod agent;
pub mod config;
pub mod serve;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the public proxy server
    Serve(serve::Args),

    /// Connect to a proxy server and answer its requests from a local server
    Agent(agent::Args),

    /// Print the effective server configuration
    Config(config::Args),
}
