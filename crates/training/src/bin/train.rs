use clap::Parser;
use training::{init_tracing, run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = TrainArgs::parse();
    let summary = run_train(args)?;
    match summary.best_val_loss() {
        Some(best) => println!(
            "Best val_loss {best:.4}; checkpoint {}",
            summary.checkpoint.display()
        ),
        None => println!("No validation loss recorded; see {}", summary.log.display()),
    }
    Ok(())
}
