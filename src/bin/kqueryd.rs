use anyhow::Result;

fn main() -> Result<()> {
    kquery::cli::run(kquery::cli::CliMode::Daemon)
}
