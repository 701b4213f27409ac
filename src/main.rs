use anyhow::Error;

use crate::program::{Options, Program};

mod program;
mod tui;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let options = Options::parse(std::env::args().skip(1))?;
    Program::new(options).run().await
}
