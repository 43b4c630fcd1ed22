//! Merging of raw cascade hits into detections.
//!
//! Same rules as OpenCV's `groupRectangles`: cluster similar rectangles,
//! average each cluster, keep clusters with more than `group_threshold`
//! members, and drop small clusters nested inside stronger ones.

use crate::types::FaceRect;

#[derive(Clone, Copy, Debug)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

impl From<FaceRect> for Rect {
    fn from(r: FaceRect) -> Self {
        Self {
            x: r.x as i64,
            y: r.y as i64,
            w: r.width as i64,
            h: r.height as i64,
        }
    }
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.w.min(b.w) + a.h.min(b.h)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Assign a class label to each rectangle. Labels are numbered in order of
/// first appearance, so the result is independent of union order.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; n];
    let mut labels = Vec::with_capacity(n);
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if root_label[root] == usize::MAX {
            root_label[root] = classes;
            classes += 1;
        }
        labels.push(root_label[root]);
    }
    (labels, classes)
}

/// Cluster raw hits. With `group_threshold == 0` the input is returned as is.
pub fn group_rectangles(rects: &[FaceRect], group_threshold: u32, eps: f64) -> Vec<FaceRect> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let raw: Vec<Rect> = rects.iter().copied().map(Rect::from).collect();
    let (labels, classes) = partition(&raw, eps);

    let mut totals = vec![(0i64, 0i64, 0i64, 0i64); classes];
    let mut counts = vec![0u32; classes];
    for (r, &cls) in raw.iter().zip(labels.iter()) {
        let t = &mut totals[cls];
        t.0 += r.x;
        t.1 += r.y;
        t.2 += r.w;
        t.3 += r.h;
        counts[cls] += 1;
    }

    let averaged: Vec<Rect> = totals
        .iter()
        .zip(counts.iter())
        .map(|(t, &n)| {
            let s = 1.0 / n as f64;
            Rect {
                x: (t.0 as f64 * s).round() as i64,
                y: (t.1 as f64 * s).round() as i64,
                w: (t.2 as f64 * s).round() as i64,
                h: (t.3 as f64 * s).round() as i64,
            }
        })
        .collect();

    let mut out = Vec::new();
    for i in 0..classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = averaged[i];

        let nested = (0..classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.w as f64 * eps).round() as i64;
            let dy = (r2.h as f64 * eps).round() as i64;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            out.push(FaceRect::new(
                r1.x.max(0) as u32,
                r1.y.max(0) as u32,
                r1.w.max(0) as u32,
                r1.h.max(0) as u32,
            ));
        }
    }
    out
}
