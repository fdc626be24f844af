mod app;

use prior_viewer::launch;
use prior_viewer::settings::ViewerSettings;
use tracing_subscriber::EnvFilter;

fn main() -> eframe::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => (None, Some(format!("Launch URL/args error: {err}"))),
    };
    let settings = ViewerSettings::load();

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 820.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "Prior Viewer",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(app::PriorViewerApp::new(
                initial_request.clone(),
                initial_status.clone(),
                settings.clone(),
            )))
        }),
    )
}
