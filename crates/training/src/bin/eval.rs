use clap::Parser;
use training::{init_tracing, run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = EvalArgs::parse();
    let scores = run_eval(&args)?;
    println!(
        "{:?} over {} pairs: EER {:.4}, AUC {:.4}",
        args.corpus, args.pairs, scores.eer, scores.auc
    );
    Ok(())
}
