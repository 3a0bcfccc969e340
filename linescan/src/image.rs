// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Multi-channel images in the scanner's native line-planar layout.
//!
//! Each row is stored as every column of channel 0, then every column of channel 1, and so on.
//! This is the layout raw lines arrive in, so raw data can be viewed without copying.
use core::ops::{Index, IndexMut, Range};

use num_traits::{ToPrimitive, Zero};

use crate::util::mean;

/// Shared indexing logic for [`Image`] and [`ImageView`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Shape {
    rows: usize,
    columns: usize,
    channels: usize,
}

impl Shape {
    fn row_len(&self) -> usize {
        self.columns * self.channels
    }

    fn len(&self) -> usize {
        self.rows * self.row_len()
    }

    fn offset(&self, row: usize, column: usize, channel: usize) -> usize {
        assert!(
            row < self.rows && column < self.columns && channel < self.channels,
            "({}, {}, {}) is out of bounds for a {}x{}x{} image",
            row,
            column,
            channel,
            self.rows,
            self.columns,
            self.channels
        );
        row * self.row_len() + channel * self.columns + column
    }
}

/// An owned image, indexed by `(row, column, channel)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image<S> {
    shape: Shape,
    data: Vec<S>,
}

/// A borrowed image, indexed by `(row, column, channel)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageView<'a, S> {
    shape: Shape,
    data: &'a [S],
}

impl<S: Copy + Zero> Image<S> {
    /// A zero-filled image.
    pub fn new(rows: usize, columns: usize, channels: usize) -> Self {
        let shape = Shape {
            rows,
            columns,
            channels,
        };
        Self {
            data: vec![S::zero(); shape.len()],
            shape,
        }
    }
}

impl<S> Image<S> {
    /// Wrap line-planar data. Trailing partial rows are dropped.
    pub fn from_vec(data: Vec<S>, columns: usize, channels: usize) -> Self {
        let row_len = (columns * channels).max(1);
        let rows = data.len() / row_len;
        let mut data = data;
        data.truncate(rows * row_len);
        Self {
            shape: Shape {
                rows,
                columns,
                channels,
            },
            data,
        }
    }

    pub fn view(&self) -> ImageView<'_, S> {
        ImageView {
            shape: self.shape,
            data: &self.data,
        }
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn columns(&self) -> usize {
        self.shape.columns
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn into_vec(self) -> Vec<S> {
        self.data
    }
}

impl<'a, S> ImageView<'a, S> {
    /// View line-planar data. Trailing partial rows are ignored.
    pub fn new(data: &'a [S], columns: usize, channels: usize) -> Self {
        let row_len = (columns * channels).max(1);
        let rows = data.len() / row_len;
        Self {
            shape: Shape {
                rows,
                columns,
                channels,
            },
            data: &data[..rows * row_len],
        }
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn columns(&self) -> usize {
        self.shape.columns
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    /// Every column of one channel of one row.
    pub fn plane(&self, row: usize, channel: usize) -> &'a [S] {
        let start = self.shape.offset(row, 0, channel);
        let data: &'a [S] = self.data;
        &data[start..start + self.shape.columns]
    }

    /// Restrict the view to a range of rows.
    pub fn rows_range(&self, rows: Range<usize>) -> ImageView<'a, S> {
        let end = rows.end.min(self.shape.rows);
        let start = rows.start.min(end);
        let row_len = self.shape.row_len();
        let data: &'a [S] = self.data;
        ImageView {
            shape: Shape {
                rows: end - start,
                ..self.shape
            },
            data: &data[start * row_len..end * row_len],
        }
    }
}

impl<'a, S: Copy + ToPrimitive> ImageView<'a, S> {
    /// The mean of one channel over every row, for a range of columns.
    pub fn mean(&self, channel: usize, columns: Range<usize>) -> Option<f32> {
        let columns = columns.start.min(self.shape.columns)..columns.end.min(self.shape.columns);
        mean(
            (0..self.shape.rows)
                .flat_map(|row| self.plane(row, channel)[columns.clone()].iter().copied()),
        )
    }

    /// The mean of one column of one channel over every row.
    pub fn column_mean(&self, column: usize, channel: usize) -> Option<f32> {
        mean((0..self.shape.rows).map(|row| self[(row, column, channel)]))
    }

    /// The mean of every sample in a row.
    pub fn row_mean(&self, row: usize) -> Option<f32> {
        let start = self.shape.offset(row, 0, 0);
        mean(self.data[start..start + self.shape.row_len()].iter().copied())
    }
}

impl<S> Index<(usize, usize, usize)> for Image<S> {
    type Output = S;

    fn index(&self, (row, column, channel): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.shape.offset(row, column, channel)]
    }
}

impl<S> IndexMut<(usize, usize, usize)> for Image<S> {
    fn index_mut(&mut self, (row, column, channel): (usize, usize, usize)) -> &mut Self::Output {
        let offset = self.shape.offset(row, column, channel);
        &mut self.data[offset]
    }
}

impl<'a, S> Index<(usize, usize, usize)> for ImageView<'a, S> {
    type Output = S;

    fn index(&self, (row, column, channel): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.shape.offset(row, column, channel)]
    }
}
