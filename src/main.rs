use clap::Parser;

use autolabel::cli::SubCommandExtend;
use autolabel::config::{Opts, SubCommand};
use autolabel::session::FailureReason;

#[tokio::main]
async fn main() {
    env_logger::init();

    let opts = Opts::parse();
    let result = match &opts.subcmd {
        SubCommand::Start(cmd) => cmd.run(&opts).await,
        SubCommand::Annotate(cmd) => cmd.run(&opts).await,
        SubCommand::Status(cmd) => cmd.run(&opts).await,
        SubCommand::Sessions(cmd) => cmd.run(&opts).await,
        SubCommand::Server(cmd) => cmd.run(&opts).await,
    };

    if let Err(e) = result {
        // failed sessions carry their reason through to the exit code
        if let Some(reason) = e.downcast_ref::<FailureReason>() {
            eprintln!("session failed: {reason}");
            std::process::exit(reason.exit_code());
        }
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}
