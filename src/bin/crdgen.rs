use kube::CustomResourceExt;
use provisioner::{ObjectBucket, ObjectBucketClaim};

use clap::Parser;
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // Output directory
    #[arg(short, long, default_value = ".")]
    output: String,
    /// Print both definitions to stdout as one multi-document stream instead
    #[arg(long)]
    stdout: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let claim = serde_yaml::to_string(&ObjectBucketClaim::crd())?;
    let bucket = serde_yaml::to_string(&ObjectBucket::crd())?;
    if args.stdout {
        print!("{claim}---\n{bucket}");
        return Ok(());
    }
    // Create directory if it does not exist
    std::fs::create_dir_all(&args.output)?;
    std::fs::write(format!("{}/objectbucketclaim.yaml", args.output), claim)?;
    std::fs::write(format!("{}/objectbucket.yaml", args.output), bucket)?;
    Ok(())
}
