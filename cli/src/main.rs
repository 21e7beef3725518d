use anyhow::Result;

fn main() -> Result<()> {
    genstore_cli::run()
}
