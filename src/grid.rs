//! Physical workspace: the image box grid and where each box lands on screen.
//!
//! Box rectangles are normalized to the workspace (0..1 on both axes). When the
//! workspace spans several screens the grid is bent so that no box straddles a
//! screen edge; see [`partition`].

use egui::{Pos2, Rect, Vec2};

use crate::error::WorkspaceError;
use crate::memento::Memorable;

/// Smallest usable area, in screen units, worth optimising for.
const MIN_USABLE_EXTENT: f32 = 20.0;

/// A physical display surface in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Screen {
    pub bounds: Rect,
    /// Bounds minus task bars and docks.
    pub working_area: Rect,
}

impl Screen {
    pub fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            working_area: bounds,
        }
    }

    pub fn with_working_area(bounds: Rect, working_area: Rect) -> Self {
        Self {
            bounds,
            working_area,
        }
    }
}

/// Normalized rectangles for a `rows` x `columns` grid, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPartition {
    pub rectangles: Vec<Rect>,
    /// False when the uniform fallback was used.
    pub optimized: bool,
}

pub fn uniform_grid(rows: usize, columns: usize) -> Vec<Rect> {
    let width = 1.0 / columns as f32;
    let height = 1.0 / rows as f32;
    let mut rectangles = Vec::with_capacity(rows * columns);
    for row in 0..rows {
        for column in 0..columns {
            rectangles.push(Rect::from_min_size(
                Pos2::new(column as f32 * width, row as f32 * height),
                Vec2::new(width, height),
            ));
        }
    }
    rectangles
}

/// Lays out the grid over `workspace`, giving each screen its own rectangular
/// sub-grid of the cells whose (uniform) centers fall on it. Falls back to the
/// uniform grid if that does not yield every cell exactly once.
pub fn partition(rows: usize, columns: usize, workspace: Rect, screens: &[Screen]) -> GridPartition {
    match optimize(rows, columns, workspace, screens) {
        Some(rectangles) => GridPartition {
            rectangles,
            optimized: true,
        },
        None => {
            log::debug!("Failed to optimize image box rectangles; defaulting to a uniform grid");
            GridPartition {
                rectangles: uniform_grid(rows, columns),
                optimized: false,
            }
        }
    }
}

fn optimize(rows: usize, columns: usize, workspace: Rect, screens: &[Screen]) -> Option<Vec<Rect>> {
    if rows == 0 || columns == 0 || workspace.width() <= 0.0 || workspace.height() <= 0.0 {
        return None;
    }
    let usable = usable_area(workspace, screens)?;
    if usable.width() < MIN_USABLE_EXTENT || usable.height() < MIN_USABLE_EXTENT {
        return None;
    }

    let cell_width = usable.width() / columns as f32;
    let cell_height = usable.height() / rows as f32;
    let mut rectangles: Vec<Option<Rect>> = vec![None; rows * columns];
    let mut assigned = 0usize;

    for screen in screens {
        let mut span: Option<(usize, usize, usize, usize)> = None;
        for row in 0..rows {
            for column in 0..columns {
                let center = Pos2::new(
                    usable.min.x + cell_width * (column as f32 + 0.5),
                    usable.min.y + cell_height * (row as f32 + 0.5),
                );
                if !contains_half_open(screen.bounds, center) {
                    continue;
                }
                span = Some(match span {
                    None => (row, row, column, column),
                    Some((first_row, _, first_column, _)) => (first_row, row, first_column, column),
                });
            }
        }

        let Some((first_row, last_row, first_column, last_column)) = span else {
            continue;
        };
        let Some(screen_usable) = intersect(workspace, screen.working_area) else {
            continue;
        };

        let normalized = normalized_sub_rect(workspace, screen_usable);
        let screen_rows = last_row - first_row + 1;
        let screen_columns = last_column.checked_sub(first_column)? + 1;
        let width = normalized.width() / screen_columns as f32;
        let height = normalized.height() / screen_rows as f32;

        for screen_row in 0..screen_rows {
            for screen_column in 0..screen_columns {
                let index = (first_row + screen_row) * columns + first_column + screen_column;
                let slot = rectangles.get_mut(index)?;
                if slot.is_some() {
                    return None;
                }
                *slot = Some(Rect::from_min_size(
                    Pos2::new(
                        normalized.min.x + screen_column as f32 * width,
                        normalized.min.y + screen_row as f32 * height,
                    ),
                    Vec2::new(width, height),
                ));
                assigned += 1;
            }
        }
    }

    if assigned != rows * columns {
        return None;
    }
    rectangles.into_iter().collect()
}

/// Bounding union of every screen's working area clipped to the workspace.
fn usable_area(workspace: Rect, screens: &[Screen]) -> Option<Rect> {
    screens
        .iter()
        .filter_map(|screen| intersect(screen.working_area, workspace))
        .reduce(|a, b| a.union(b))
}

fn intersect(a: Rect, b: Rect) -> Option<Rect> {
    let clipped = a.intersect(b);
    (clipped.width() > 0.0 && clipped.height() > 0.0).then_some(clipped)
}

fn contains_half_open(rect: Rect, point: Pos2) -> bool {
    point.x >= rect.min.x && point.x < rect.max.x && point.y >= rect.min.y && point.y < rect.max.y
}

fn normalized_sub_rect(outer: Rect, inner: Rect) -> Rect {
    let size = outer.size();
    Rect::from_min_max(
        Pos2::new(
            (inner.min.x - outer.min.x) / size.x,
            (inner.min.y - outer.min.y) / size.y,
        ),
        Pos2::new(
            (inner.max.x - outer.min.x) / size.x,
            (inner.max.y - outer.min.y) / size.y,
        ),
    )
}

/// Which display set of which image set an image box shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySetRef {
    pub study_instance_uid: String,
    pub display_set_uid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBox {
    pub normalized_rectangle: Rect,
    pub display_set: Option<DisplaySetRef>,
}

impl ImageBox {
    fn empty(normalized_rectangle: Rect) -> Self {
        Self {
            normalized_rectangle,
            display_set: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_set.is_none()
    }
}

pub struct PhysicalWorkspace {
    rows: usize,
    columns: usize,
    image_boxes: Vec<ImageBox>,
    selected: Option<usize>,
    screen_rectangle: Rect,
    screens: Vec<Screen>,
    optimized: bool,
    grid_computations: usize,
}

impl PhysicalWorkspace {
    pub fn new(screen_rectangle: Rect, screens: Vec<Screen>) -> Self {
        Self {
            rows: 0,
            columns: 0,
            image_boxes: Vec::new(),
            selected: None,
            screen_rectangle,
            screens,
            optimized: false,
            grid_computations: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn image_boxes(&self) -> &[ImageBox] {
        &self.image_boxes
    }

    pub fn image_box(&self, row: usize, column: usize) -> Option<&ImageBox> {
        if column >= self.columns {
            return None;
        }
        self.image_boxes.get(row * self.columns + column)
    }

    pub fn screen_rectangle(&self) -> Rect {
        self.screen_rectangle
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// How many times box rectangles have been computed.
    pub fn grid_computations(&self) -> usize {
        self.grid_computations
    }

    /// Replaces the grid with empty boxes. Same dimensions leave the boxes,
    /// their contents and their rectangles untouched.
    pub fn set_image_box_grid(&mut self, rows: usize, columns: usize) -> Result<(), WorkspaceError> {
        if rows == 0 || columns == 0 {
            return Err(WorkspaceError::InvalidGrid { rows, columns });
        }
        if rows == self.rows && columns == self.columns {
            return Ok(());
        }

        self.rows = rows;
        self.columns = columns;
        self.image_boxes = vec![ImageBox::empty(Rect::NOTHING); rows * columns];
        self.selected = None;
        self.recompute();
        Ok(())
    }

    pub fn set_screen_rectangle(&mut self, screen_rectangle: Rect) {
        if screen_rectangle == self.screen_rectangle {
            return;
        }
        self.screen_rectangle = screen_rectangle;
        self.recompute();
    }

    pub fn set_screens(&mut self, screens: Vec<Screen>) {
        if screens == self.screens {
            return;
        }
        self.screens = screens;
        self.recompute();
    }

    /// Recomputes every box rectangle for the current grid and screens.
    pub fn recompute(&mut self) {
        if self.image_boxes.is_empty() {
            return;
        }
        let single_screen;
        let screens = if self.screens.is_empty() {
            single_screen = [Screen::new(self.screen_rectangle)];
            &single_screen[..]
        } else {
            &self.screens[..]
        };

        let partition = partition(self.rows, self.columns, self.screen_rectangle, screens);
        for (image_box, rectangle) in self.image_boxes.iter_mut().zip(partition.rectangles) {
            image_box.normalized_rectangle = rectangle;
        }
        self.optimized = partition.optimized;
        self.grid_computations += 1;
    }

    /// Box rectangle in screen coordinates.
    pub fn screen_rect_of(&self, index: usize) -> Option<Rect> {
        let normalized = self.image_boxes.get(index)?.normalized_rectangle;
        let origin = self.screen_rectangle.min;
        let size = self.screen_rectangle.size();
        Some(Rect::from_min_max(
            Pos2::new(origin.x + normalized.min.x * size.x, origin.y + normalized.min.y * size.y),
            Pos2::new(origin.x + normalized.max.x * size.x, origin.y + normalized.max.y * size.y),
        ))
    }

    pub fn box_at(&self, point: Pos2) -> Option<usize> {
        (0..self.image_boxes.len()).find(|&index| {
            self.screen_rect_of(index)
                .is_some_and(|rect| contains_half_open(rect, point))
        })
    }

    pub fn assign(&mut self, index: usize, display_set: DisplaySetRef) -> bool {
        match self.image_boxes.get_mut(index) {
            Some(image_box) => {
                image_box.display_set = Some(display_set);
                true
            }
            None => false,
        }
    }

    /// Fills empty boxes in order; returns how many display sets were placed.
    pub fn fill_empty(&mut self, display_sets: impl IntoIterator<Item = DisplaySetRef>) -> usize {
        let mut placed = 0;
        let mut display_sets = display_sets.into_iter();
        for image_box in self.image_boxes.iter_mut().filter(|image_box| image_box.is_empty()) {
            let Some(display_set) = display_sets.next() else {
                break;
            };
            image_box.display_set = Some(display_set);
            placed += 1;
        }
        placed
    }

    pub fn is_showing(&self, study_instance_uid: &str) -> bool {
        self.image_boxes.iter().any(|image_box| {
            image_box
                .display_set
                .as_ref()
                .is_some_and(|display_set| display_set.study_instance_uid == study_instance_uid)
        })
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.image_boxes.len() {
            return false;
        }
        self.selected = Some(index);
        true
    }

    /// Selects the first box showing something, else the first box.
    pub fn select_default_image_box(&mut self) {
        self.selected = self
            .image_boxes
            .iter()
            .position(|image_box| !image_box.is_empty())
            .or_else(|| (!self.image_boxes.is_empty()).then_some(0));
    }

    /// Drops every box. Screens and the screen rectangle are kept.
    pub fn clear(&mut self) {
        self.rows = 0;
        self.columns = 0;
        self.image_boxes.clear();
        self.selected = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalWorkspaceMemento {
    rows: usize,
    columns: usize,
    image_boxes: Vec<ImageBox>,
    selected: Option<usize>,
}

impl Memorable for PhysicalWorkspace {
    type Memento = PhysicalWorkspaceMemento;

    fn create_memento(&self) -> Self::Memento {
        PhysicalWorkspaceMemento {
            rows: self.rows,
            columns: self.columns,
            image_boxes: self.image_boxes.clone(),
            selected: self.selected,
        }
    }

    fn set_memento(&mut self, memento: Self::Memento) {
        self.rows = memento.rows;
        self.columns = memento.columns;
        self.image_boxes = memento.image_boxes;
        self.selected = memento.selected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f32, y: f32, width: f32, height: f32) -> Rect {
        Rect::from_min_size(Pos2::new(x, y), Vec2::new(width, height))
    }

    fn approx_eq(a: Rect, b: Rect) -> bool {
        const EPSILON: f32 = 1e-5;
        (a.min.x - b.min.x).abs() < EPSILON
            && (a.min.y - b.min.y).abs() < EPSILON
            && (a.max.x - b.max.x).abs() < EPSILON
            && (a.max.y - b.max.y).abs() < EPSILON
    }

    fn overlaps(a: Rect, b: Rect) -> bool {
        const EPSILON: f32 = 1e-5;
        a.min.x < b.max.x - EPSILON
            && b.min.x < a.max.x - EPSILON
            && a.min.y < b.max.y - EPSILON
            && b.min.y < a.max.y - EPSILON
    }

    #[test]
    fn single_screen_matches_the_uniform_grid() {
        let monitor = rect(0.0, 0.0, 1920.0, 1080.0);
        let result = partition(3, 4, monitor, &[Screen::new(monitor)]);

        assert!(result.optimized);
        let uniform = uniform_grid(3, 4);
        assert_eq!(result.rectangles.len(), uniform.len());
        for (optimized, uniform) in result.rectangles.iter().zip(&uniform) {
            assert!(approx_eq(*optimized, *uniform), "{optimized:?} != {uniform:?}");
        }
    }

    #[test]
    fn two_monitors_split_a_two_by_four_grid() {
        let left = rect(0.0, 0.0, 1920.0, 1080.0);
        let right = rect(1920.0, 0.0, 1920.0, 1080.0);
        let workspace = rect(0.0, 0.0, 3840.0, 1080.0);
        let result = partition(2, 4, workspace, &[Screen::new(left), Screen::new(right)]);

        assert!(result.optimized);
        assert_eq!(result.rectangles.len(), 8);
        let on_left = result
            .rectangles
            .iter()
            .filter(|rect| rect.max.x <= 0.5 + 1e-5)
            .count();
        let on_right = result
            .rectangles
            .iter()
            .filter(|rect| rect.min.x >= 0.5 - 1e-5)
            .count();
        assert_eq!((on_left, on_right), (4, 4));

        for (i, a) in result.rectangles.iter().enumerate() {
            for b in &result.rectangles[i + 1..] {
                assert!(!overlaps(*a, *b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn task_bar_shrinks_only_its_own_screen() {
        let left = Screen::with_working_area(
            rect(0.0, 0.0, 1000.0, 1000.0),
            rect(0.0, 0.0, 1000.0, 900.0),
        );
        let right = Screen::new(rect(1000.0, 0.0, 1000.0, 1000.0));
        let workspace = rect(0.0, 0.0, 2000.0, 1000.0);
        let result = partition(1, 2, workspace, &[left, right]);

        assert!(result.optimized);
        assert!(approx_eq(result.rectangles[0], rect(0.0, 0.0, 0.5, 0.9)));
        assert!(approx_eq(result.rectangles[1], rect(0.5, 0.0, 0.5, 1.0)));
    }

    #[test]
    fn mirrored_screens_fall_back_to_uniform() {
        let monitor = rect(0.0, 0.0, 1000.0, 1000.0);
        let result = partition(2, 2, monitor, &[Screen::new(monitor), Screen::new(monitor)]);
        assert!(!result.optimized);
        assert_eq!(result.rectangles, uniform_grid(2, 2));
    }

    #[test]
    fn unclaimed_cell_falls_back_to_uniform() {
        let left = Screen::new(rect(0.0, 0.0, 1000.0, 1000.0));
        // Offset downwards, so the top-right cell center is on no screen.
        let right = Screen::new(rect(1000.0, 500.0, 1000.0, 1000.0));
        let result = partition(2, 2, rect(0.0, 0.0, 2000.0, 1000.0), &[left, right]);
        assert!(!result.optimized);
        assert_eq!(result.rectangles, uniform_grid(2, 2));
    }

    #[test]
    fn tiny_usable_area_falls_back_to_uniform() {
        let monitor = rect(0.0, 0.0, 10.0, 10.0);
        let result = partition(2, 2, monitor, &[Screen::new(monitor)]);
        assert!(!result.optimized);
        assert_eq!(result.rectangles, uniform_grid(2, 2));
    }

    #[test]
    fn workspace_off_all_screens_uses_uniform_grid() {
        let monitor = Screen::new(rect(0.0, 0.0, 1000.0, 1000.0));
        let result = partition(2, 3, rect(5000.0, 5000.0, 800.0, 600.0), &[monitor]);
        assert!(!result.optimized);
        assert_eq!(result.rectangles, uniform_grid(2, 3));
    }

    #[test]
    fn same_dimensions_do_not_recompute() {
        let monitor = rect(0.0, 0.0, 1920.0, 1080.0);
        let mut workspace = PhysicalWorkspace::new(monitor, vec![Screen::new(monitor)]);
        workspace.set_image_box_grid(2, 2).expect("valid grid");
        workspace.assign(
            0,
            DisplaySetRef {
                study_instance_uid: "st1".to_string(),
                display_set_uid: "se1".to_string(),
            },
        );
        assert_eq!(workspace.grid_computations(), 1);

        workspace.set_image_box_grid(2, 2).expect("valid grid");
        assert_eq!(workspace.grid_computations(), 1);
        assert!(!workspace.image_boxes()[0].is_empty());

        workspace.set_image_box_grid(1, 2).expect("valid grid");
        assert_eq!(workspace.grid_computations(), 2);
        assert!(workspace.image_boxes().iter().all(ImageBox::is_empty));

        workspace.set_screen_rectangle(rect(0.0, 0.0, 1280.0, 1024.0));
        assert_eq!(workspace.grid_computations(), 3);
    }

    #[test]
    fn zero_sized_grid_is_rejected() {
        let mut workspace = PhysicalWorkspace::new(rect(0.0, 0.0, 100.0, 100.0), Vec::new());
        assert_eq!(
            workspace.set_image_box_grid(0, 3),
            Err(WorkspaceError::InvalidGrid { rows: 0, columns: 3 })
        );
    }

    #[test]
    fn fill_empty_skips_occupied_boxes() {
        let mut workspace = PhysicalWorkspace::new(rect(0.0, 0.0, 100.0, 100.0), Vec::new());
        workspace.set_image_box_grid(1, 3).expect("valid grid");
        let reference = |uid: &str| DisplaySetRef {
            study_instance_uid: "st".to_string(),
            display_set_uid: uid.to_string(),
        };
        workspace.assign(1, reference("taken"));

        let placed = workspace.fill_empty(vec![reference("a"), reference("b"), reference("c")]);
        assert_eq!(placed, 2);
        let uids = workspace
            .image_boxes()
            .iter()
            .map(|image_box| image_box.display_set.as_ref().map(|set| set.display_set_uid.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(uids, vec![Some("a"), Some("taken"), Some("b")]);
    }

    #[test]
    fn memento_round_trips_grid_contents_and_selection() {
        let left = rect(0.0, 0.0, 1920.0, 1080.0);
        let right = rect(1920.0, 0.0, 1920.0, 1080.0);
        let mut workspace = PhysicalWorkspace::new(
            rect(0.0, 0.0, 3840.0, 1080.0),
            vec![Screen::new(left), Screen::new(right)],
        );
        workspace.set_image_box_grid(2, 4).expect("valid grid");
        workspace.assign(
            3,
            DisplaySetRef {
                study_instance_uid: "st1".to_string(),
                display_set_uid: "se1".to_string(),
            },
        );
        workspace.select(3);
        let memento = workspace.create_memento();

        workspace.set_image_box_grid(1, 1).expect("valid grid");
        workspace.select_default_image_box();
        assert_ne!(workspace.create_memento(), memento);

        workspace.set_memento(memento.clone());
        assert_eq!(workspace.create_memento(), memento);
        assert_eq!((workspace.rows(), workspace.columns()), (2, 4));
        assert_eq!(workspace.selected_index(), Some(3));
    }

    #[test]
    fn default_selection_prefers_a_box_with_content() {
        let mut workspace = PhysicalWorkspace::new(rect(0.0, 0.0, 100.0, 100.0), Vec::new());
        workspace.set_image_box_grid(2, 2).expect("valid grid");
        workspace.select_default_image_box();
        assert_eq!(workspace.selected_index(), Some(0));

        workspace.assign(
            2,
            DisplaySetRef {
                study_instance_uid: "st1".to_string(),
                display_set_uid: "se1".to_string(),
            },
        );
        workspace.select_default_image_box();
        assert_eq!(workspace.selected_index(), Some(2));
    }

    #[test]
    fn box_at_takes_screen_coordinates() {
        let mut workspace = PhysicalWorkspace::new(rect(100.0, 50.0, 400.0, 200.0), Vec::new());
        workspace.set_image_box_grid(2, 2).expect("valid grid");

        assert_eq!(workspace.box_at(Pos2::new(150.0, 100.0)), Some(0));
        assert_eq!(workspace.box_at(Pos2::new(310.0, 100.0)), Some(1));
        assert_eq!(workspace.box_at(Pos2::new(350.0, 200.0)), Some(3));
        assert_eq!(workspace.box_at(Pos2::new(520.0, 100.0)), None);
        assert_eq!(workspace.box_at(Pos2::new(50.0, 100.0)), None);
        let bottom_right = workspace.screen_rect_of(3).expect("box 3");
        assert!((bottom_right.min.x - 300.0).abs() < 0.01);
        assert!((bottom_right.min.y - 150.0).abs() < 0.01);
        assert!((bottom_right.max.x - 500.0).abs() < 0.01);
        assert!((bottom_right.max.y - 250.0).abs() < 0.01);
    }

    #[test]
    fn clear_drops_boxes_and_contents() {
        let mut workspace = PhysicalWorkspace::new(rect(0.0, 0.0, 100.0, 100.0), Vec::new());
        workspace.set_image_box_grid(1, 2).expect("valid grid");
        workspace.fill_empty([DisplaySetRef {
            study_instance_uid: "st1".to_string(),
            display_set_uid: "se1".to_string(),
        }]);
        workspace.select(0);

        workspace.clear();
        assert!(workspace.image_boxes().is_empty());
        assert_eq!((workspace.rows(), workspace.columns()), (0, 0));
        assert_eq!(workspace.selected_index(), None);
        assert!(!workspace.is_showing("st1"));

        workspace.set_image_box_grid(1, 2).expect("valid grid");
        assert_eq!(workspace.image_boxes().len(), 2);
    }
}
