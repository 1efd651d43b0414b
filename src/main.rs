use anyhow::Result;

fn main() -> Result<()> {
    linkmaster::cli::run()
}
