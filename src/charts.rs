//! Diagnostic charts rendered to standalone SVG documents.

const WIDTH: f64 = 960.0;
const MIN_HEIGHT: f64 = 540.0;
const BAR_ROW_HEIGHT: f64 = 22.0;
const TOP: f64 = 48.0;
const BOTTOM: f64 = 40.0;
const RIGHT: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    HorizontalBar,
    Stem,
    Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    name: String,
    title: String,
    kind: ChartKind,
    labels: Vec<String>,
    values: Vec<f64>,
    x_label: Option<String>,
    guides: Vec<f64>,
}

impl Chart {
    pub fn horizontal_bars(
        name: impl Into<String>,
        title: impl Into<String>,
        labels: Vec<String>,
        values: Vec<f64>,
    ) -> Self {
        Self::new(name, title, ChartKind::HorizontalBar, labels, values)
    }

    pub fn stem(name: impl Into<String>, title: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, title, ChartKind::Stem, Vec::new(), values)
    }

    pub fn line(name: impl Into<String>, title: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, title, ChartKind::Line, Vec::new(), values)
    }

    fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        kind: ChartKind,
        labels: Vec<String>,
        values: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            kind,
            labels,
            values,
            x_label: None,
            guides: Vec::new(),
        }
    }

    pub fn with_x_label(mut self, label: impl Into<String>) -> Self {
        self.x_label = Some(label.into());
        self
    }

    /// Dashed horizontal reference lines at the given values.
    pub fn with_guides(mut self, guides: Vec<f64>) -> Self {
        self.guides = guides;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChartKind {
        self.kind
    }

    pub fn artifact_key(&self) -> String {
        format!("plots/{}.svg", self.name)
    }

    pub fn render_svg(&self) -> String {
        let height = match self.kind {
            ChartKind::HorizontalBar => {
                (TOP + BOTTOM + BAR_ROW_HEIGHT * self.values.len() as f64).max(MIN_HEIGHT)
            }
            ChartKind::Stem | ChartKind::Line => MIN_HEIGHT,
        };

        let mut out = String::new();
        out.push_str(&format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{WIDTH}\" height=\"{height}\" viewBox=\"0 0 {WIDTH} {height}\">\n"
        ));
        out.push_str(&format!(
            "<rect width=\"{WIDTH}\" height=\"{height}\" fill=\"#ffffff\"/>\n"
        ));
        out.push_str(&format!(
            "<text x=\"{}\" y=\"28\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"18\">{}</text>\n",
            WIDTH / 2.0,
            escape_xml(&self.title)
        ));

        if self.values.is_empty() {
            out.push_str(&format!(
                "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"14\" fill=\"#5f6a73\">no data</text>\n",
                WIDTH / 2.0,
                height / 2.0
            ));
            out.push_str("</svg>\n");
            return out;
        }

        match self.kind {
            ChartKind::HorizontalBar => self.render_bars(&mut out, height),
            ChartKind::Stem => self.render_series(&mut out, height, false),
            ChartKind::Line => self.render_series(&mut out, height, true),
        }

        if let Some(label) = &self.x_label {
            out.push_str(&format!(
                "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"13\">{}</text>\n",
                WIDTH / 2.0,
                height - 10.0,
                escape_xml(label)
            ));
        }

        out.push_str("</svg>\n");
        out
    }

    fn render_bars(&self, out: &mut String, height: f64) {
        let left = 200.0;
        let plot_width = WIDTH - left - RIGHT;
        let (lo, hi) = value_range(&self.values, &[]);
        let scale_x = |v: f64| left + (v - lo) / (hi - lo) * plot_width;
        let zero_x = scale_x(0.0);
        let row_height = (height - TOP - BOTTOM) / self.values.len() as f64;

        for (idx, value) in self.values.iter().enumerate() {
            let value = finite_or_zero(*value);
            let y = TOP + idx as f64 * row_height;
            let x_end = scale_x(value);
            let (x, w) = if x_end >= zero_x {
                (zero_x, x_end - zero_x)
            } else {
                (x_end, zero_x - x_end)
            };
            let label = self.labels.get(idx).map(String::as_str).unwrap_or_default();
            out.push_str(&format!(
                "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\" font-family=\"sans-serif\" font-size=\"12\">{}</text>\n",
                left - 8.0,
                y + row_height * 0.65,
                escape_xml(label)
            ));
            out.push_str(&format!(
                "<rect x=\"{x:.1}\" y=\"{:.1}\" width=\"{w:.1}\" height=\"{:.1}\" fill=\"#24576b\"><title>{}: {value}</title></rect>\n",
                y + row_height * 0.15,
                row_height * 0.7,
                escape_xml(label)
            ));
        }
        out.push_str(&format!(
            "<line x1=\"{zero_x:.1}\" y1=\"{TOP}\" x2=\"{zero_x:.1}\" y2=\"{:.1}\" stroke=\"#182026\"/>\n",
            height - BOTTOM
        ));
    }

    fn render_series(&self, out: &mut String, height: f64, connect: bool) {
        let left = 64.0;
        let plot_width = WIDTH - left - RIGHT;
        let plot_height = height - TOP - BOTTOM;
        let (lo, hi) = value_range(&self.values, &self.guides);
        let last = (self.values.len().max(2) - 1) as f64;
        let scale_x = |i: usize| left + i as f64 / last * plot_width;
        let scale_y = |v: f64| TOP + (hi - v) / (hi - lo) * plot_height;
        let zero_y = scale_y(0.0_f64.clamp(lo, hi));

        out.push_str(&format!(
            "<line x1=\"{left}\" y1=\"{zero_y:.1}\" x2=\"{:.1}\" y2=\"{zero_y:.1}\" stroke=\"#182026\"/>\n",
            left + plot_width
        ));
        for guide in &self.guides {
            let y = scale_y(*guide);
            out.push_str(&format!(
                "<line x1=\"{left}\" y1=\"{y:.1}\" x2=\"{:.1}\" y2=\"{y:.1}\" stroke=\"#8c6a00\" stroke-dasharray=\"6 4\"/>\n",
                left + plot_width
            ));
        }
        out.push_str(&format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\" font-family=\"sans-serif\" font-size=\"11\">{}</text>\n",
            left - 6.0,
            scale_y(hi) + 4.0,
            format_tick(hi)
        ));
        out.push_str(&format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\" font-family=\"sans-serif\" font-size=\"11\">{}</text>\n",
            left - 6.0,
            scale_y(lo) + 4.0,
            format_tick(lo)
        ));

        if connect {
            let points: Vec<String> = self
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("{:.1},{:.1}", scale_x(i), scale_y(finite_or_zero(*v))))
                .collect();
            out.push_str(&format!(
                "<polyline points=\"{}\" fill=\"none\" stroke=\"#24576b\" stroke-width=\"1.5\"/>\n",
                points.join(" ")
            ));
        } else {
            for (i, v) in self.values.iter().enumerate() {
                let x = scale_x(i);
                let y = scale_y(finite_or_zero(*v));
                out.push_str(&format!(
                    "<line x1=\"{x:.1}\" y1=\"{zero_y:.1}\" x2=\"{x:.1}\" y2=\"{y:.1}\" stroke=\"#24576b\"/><circle cx=\"{x:.1}\" cy=\"{y:.1}\" r=\"2.5\" fill=\"#24576b\"/>\n"
                ));
            }
        }
    }
}

fn value_range(values: &[f64], guides: &[f64]) -> (f64, f64) {
    let (mut lo, mut hi) = values
        .iter()
        .chain(guides)
        .copied()
        .filter(|v| v.is_finite())
        .fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if hi - lo <= f64::EPSILON {
        lo -= 1.0;
        hi += 1.0;
    }
    (lo, hi)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn format_tick(value: f64) -> String {
    if value.abs() >= 100.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.3}")
    }
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
