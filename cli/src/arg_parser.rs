use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "signctl", about = "Client for the signd re-signing service")]
pub struct Cli {
    /// Base URL of the signd server.
    #[arg(long, env = "SIGND_SERVER", default_value = "http://localhost:8080")]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a package plus credentials, wait, and download the signed
    /// result.
    Sign {
        /// The .ipa to re-sign.
        package: PathBuf,
        /// PKCS#12 signing certificate.
        #[arg(short = 'k', long)]
        certificate: PathBuf,
        /// Provisioning profile.
        #[arg(short = 'm', long)]
        profile: PathBuf,
        /// Optional entitlements plist.
        #[arg(short = 'e', long)]
        entitlements: Option<PathBuf>,
        /// Where to write the signed package.
        #[arg(short = 'o', long, default_value = "signed.ipa")]
        output: PathBuf,
    },
    /// Query a job's status.
    Status {
        job_id: String,
    },
    /// Cancel a job.
    Cancel {
        job_id: String,
    },
}
