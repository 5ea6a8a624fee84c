use convoy::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    convoy::run(config)?;
    Ok(())
}
