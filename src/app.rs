use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use eframe::egui::{self, Sense, ViewportCommand};

use prior_viewer::grid::PhysicalWorkspace;
use prior_viewer::launch::LaunchRequest;
use prior_viewer::loader::StudyLoaders;
use prior_viewer::local_store::{LocalStore, LocalStoreLoaderFactory, LocalStorePriorFinder};
use prior_viewer::memento::Memorable;
use prior_viewer::settings::ViewerSettings;
use prior_viewer::viewer::{ImageViewer, ViewerEvent, WorkspaceMemento};

const APP_TITLE: &str = "Prior Viewer";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const PRIOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct OpenStore {
    store: Arc<LocalStore>,
    viewer: ImageViewer,
    initial_layout: WorkspaceMemento,
}

pub struct PriorViewerApp {
    settings: ViewerSettings,
    open: Option<OpenStore>,
    pending_launch_request: Option<LaunchRequest>,
    status_line: String,
    show_study_list: bool,
}

impl PriorViewerApp {
    pub fn new(
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
        settings: ViewerSettings,
    ) -> Self {
        Self {
            settings,
            open: None,
            pending_launch_request: initial_request,
            status_line: initial_status.unwrap_or_default(),
            show_study_list: true,
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = egui::Color32::from_gray(28);
        visuals.panel_fill = egui::Color32::BLACK;
        visuals.window_fill = egui::Color32::BLACK;
        visuals.extreme_bg_color = egui::Color32::BLACK;
        visuals.window_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line_base);
        ctx.set_visuals(visuals);
    }

    fn is_loading(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|open| open.viewer.is_prior_loading_active())
    }

    fn pick_store(&mut self, ctx: &egui::Context) {
        if let Some(dir) = rfd::FileDialog::new().pick_folder() {
            self.pending_launch_request = Some(LaunchRequest {
                store: dir,
                studies: Vec::new(),
            });
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
            ctx.request_repaint();
        }
    }

    fn handle_launch_request(&mut self, request: LaunchRequest, ctx: &egui::Context) {
        if let Some(mut previous) = self.open.take() {
            previous.viewer.close();
        }
        let window = ctx
            .input(|input| input.viewport().inner_rect)
            .unwrap_or_else(|| ctx.screen_rect());

        match self.open_store(request.store.clone(), &request.studies, window) {
            Ok(open) => {
                self.status_line = format!(
                    "Opened {} ({} studies)",
                    open.store.root().display(),
                    open.store.len()
                );
                self.open = Some(open);
            }
            Err(err) => {
                log::error!("Could not open {}: {err:#}", request.store.display());
                self.status_line = format!("Could not open {}: {err:#}", request.store.display());
            }
        }
    }

    fn open_store(
        &self,
        root: PathBuf,
        studies: &[String],
        window: egui::Rect,
    ) -> Result<OpenStore> {
        let store = Arc::new(LocalStore::open(&root)?);
        let studies = if studies.is_empty() {
            let latest = store
                .latest_study()
                .ok_or_else(|| anyhow!("{} contains no studies", root.display()))?;
            vec![latest.item.study_instance_uid.clone()]
        } else {
            studies.to_vec()
        };

        let loaders =
            StudyLoaders::new().with(Arc::new(LocalStoreLoaderFactory::new(Arc::clone(&store))));
        let finder = Arc::new(LocalStorePriorFinder::new(Arc::clone(&store)));
        let physical = PhysicalWorkspace::new(window, self.settings.screens());
        let mut viewer = ImageViewer::new(loaders, finder, physical, self.settings.viewer_options());

        let requests = studies
            .iter()
            .map(|uid| store.load_args(uid))
            .collect::<Vec<_>>();
        if let Err(err) = viewer.load_studies(requests) {
            // Partial loads still leave something to show; layout decides.
            log::warn!("Primary studies did not load completely: {err}");
        }
        viewer.layout().context("Nothing to display")?;
        let initial_layout = viewer.create_memento();

        Ok(OpenStore {
            store,
            viewer,
            initial_layout,
        })
    }

    fn poll_viewer(&mut self, ctx: &egui::Context) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if open.viewer.pump() > 0 {
            ctx.request_repaint();
        }
        for event in open.viewer.drain_events() {
            match event {
                ViewerEvent::StudyLoaded {
                    study_instance_uid,
                    error: Some(error),
                } => {
                    self.status_line = format!("{study_instance_uid}: {}", error.user_message());
                }
                ViewerEvent::StudyLoadFailed {
                    study_instance_uid,
                    error,
                } => {
                    self.status_line = format!("{study_instance_uid}: {}", error.user_message());
                }
                ViewerEvent::PriorLoadingActiveChanged(true) => {
                    self.status_line = "Loading prior studies...".to_string();
                }
                ViewerEvent::PriorLoadingActiveChanged(false) => {
                    if open.viewer.prior_load_error().is_none() {
                        self.status_line = format!(
                            "{} studies open",
                            open.viewer.logical_workspace().len()
                        );
                    }
                }
                ViewerEvent::PriorStudiesFailed(error) => {
                    self.status_line = error.to_string();
                }
                ViewerEvent::DuplicatePriorDiscarded { study_instance_uid } => {
                    log::debug!("Prior {study_instance_uid} was already open");
                }
                ViewerEvent::StudyLoaded { .. } | ViewerEvent::LayoutCompleted => {}
            }
        }
        if open.viewer.is_prior_loading_active() {
            ctx.request_repaint_after(PRIOR_POLL_INTERVAL);
        }
    }

    fn reset_layout(&mut self) {
        if let Some(open) = self.open.as_mut() {
            open.viewer.set_memento(open.initial_layout.clone());
            self.status_line = "Layout reset".to_string();
        }
    }

    fn stop_priors(&mut self) {
        if let Some(open) = self.open.as_mut() {
            if open.viewer.is_prior_loading_active() {
                open.viewer.stop_loading_priors();
                self.status_line = "Prior loading stopped".to_string();
            }
        }
    }

    fn show_studies_panel(&self, ui: &mut egui::Ui) {
        let Some(open) = self.open.as_ref() else {
            ui.weak("No store open");
            return;
        };
        egui::ScrollArea::vertical().show(ui, |ui| {
            for image_set in open.viewer.logical_workspace().image_sets() {
                let shown = open
                    .viewer
                    .physical_workspace()
                    .is_showing(&image_set.study_instance_uid);
                let text = egui::RichText::new(&image_set.name);
                let text = if shown { text.strong() } else { text };
                ui.label(text);
                match &image_set.load_error {
                    Some(error) => {
                        ui.colored_label(egui::Color32::from_rgb(200, 90, 70), error.user_message());
                    }
                    None => {
                        ui.weak(format!("{} series", image_set.display_sets.len()));
                    }
                }
                ui.separator();
            }
        });
    }

    fn show_grid(&mut self, ui: &mut egui::Ui) {
        let Some(open) = self.open.as_mut() else {
            ui.centered_and_justified(|ui| {
                ui.label("Open a store to begin");
            });
            return;
        };

        let (canvas, response) = ui.allocate_exact_size(ui.available_size(), Sense::click());
        let painter = ui.painter_at(canvas);
        let viewer = &open.viewer;
        let physical = viewer.physical_workspace();
        let to_canvas = |normalized: egui::Rect| {
            egui::Rect::from_min_max(
                canvas.min + normalized.min.to_vec2() * canvas.size(),
                canvas.min + normalized.max.to_vec2() * canvas.size(),
            )
        };

        for (index, image_box) in physical.image_boxes().iter().enumerate() {
            let rect = to_canvas(image_box.normalized_rectangle).shrink(1.0);
            let selected = physical.selected_index() == Some(index);
            let stroke_color = if selected {
                egui::Color32::from_rgb(230, 190, 60)
            } else {
                egui::Color32::from_gray(60)
            };
            painter.rect_filled(rect, 0.0, egui::Color32::from_gray(12));
            painter.rect_stroke(rect, 0.0, egui::Stroke::new(1.0, stroke_color));

            let Some(reference) = &image_box.display_set else {
                continue;
            };
            let logical = viewer.logical_workspace();
            let study = logical
                .image_set(&reference.study_instance_uid)
                .map(|image_set| image_set.name.as_str())
                .unwrap_or_default();
            let series = logical
                .display_set(reference)
                .map(|display_set| format!("{} ({} images)", display_set.name, display_set.image_count))
                .unwrap_or_default();
            painter.text(
                rect.left_top() + egui::vec2(6.0, 6.0),
                egui::Align2::LEFT_TOP,
                format!("{study}\n{series}"),
                egui::FontId::proportional(13.0),
                egui::Color32::from_gray(210),
            );
        }

        if response.clicked() {
            if let Some(pointer) = response.interact_pointer_pos() {
                let physical = open.viewer.physical_workspace_mut();
                // The canvas stands in for the workspace's screen rectangle.
                let screen = physical.screen_rectangle();
                let relative = (pointer - canvas.min) / canvas.size().max(egui::vec2(1.0, 1.0));
                if let Some(index) = physical.box_at(screen.min + relative * screen.size()) {
                    physical.select(index);
                }
            }
        }
    }
}

impl eframe::App for PriorViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);
        if self.is_loading() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
        }

        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request, ctx);
        }
        self.poll_viewer(ctx);

        let mut close_requested = false;
        let mut reset_requested = false;
        let mut stop_requested = false;
        ctx.input_mut(|input| {
            close_requested = input.consume_key(egui::Modifiers::COMMAND, egui::Key::W);
            reset_requested = input.consume_key(egui::Modifiers::NONE, egui::Key::R);
            stop_requested = input.consume_key(egui::Modifiers::NONE, egui::Key::Escape);
        });
        if close_requested {
            if let Some(mut open) = self.open.take() {
                open.viewer.close();
            }
            ctx.send_viewport_cmd(ViewportCommand::Close);
            return;
        }
        if reset_requested {
            self.reset_layout();
        }
        if stop_requested {
            self.stop_priors();
        }

        let mut open_store_clicked = false;
        egui::TopBottomPanel::top("toolbar")
            .exact_height(30.0)
            .show(ctx, |ui| {
                ui.horizontal_centered(|ui| {
                    ui.strong(format!("{APP_TITLE} v{APP_VERSION}"));
                    ui.separator();
                    if ui.button("Open store").clicked() {
                        open_store_clicked = true;
                    }
                    ui.toggle_value(&mut self.show_study_list, "Studies");
                    if self.is_loading() {
                        ui.spinner();
                    }
                    ui.label(&self.status_line);
                });
            });

        if self.show_study_list {
            egui::SidePanel::right("studies")
                .default_width(220.0)
                .show(ctx, |ui| self.show_studies_panel(ui));
        }

        egui::CentralPanel::default().show(ctx, |ui| self.show_grid(ui));

        if open_store_clicked {
            self.pick_store(ctx);
        }
    }
}
