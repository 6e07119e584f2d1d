use handcam::{app, config::Config, gui};

fn main() {
    handcam::init_logger!();

    gui::run(|| -> anyhow::Result<()> { app::run(Config::from_env()?) });
}
