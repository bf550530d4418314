//! Модуль, определяющий `Tensor` - основной контейнер данных движка.
//!
//! Тензор хранит форму произвольной размерности и два независимых буфера
//! [`SyncedMemory`]: значения (`value`) и градиенты (`gradient`). Буферы
//! выделяются лениво и никогда не сжимаются: `capacity` - наибольшее число
//! элементов, под которое уже выделена память.
//!
//! Псевдонимы буферов возникают только через явные `share_value` /
//! `share_gradient`; поэтому `Tensor` намеренно не реализует `Clone`.
//!
//! Нарушения контракта (ось вне диапазона, разделение буферов разного
//! размера, выход смещения за границы) - ошибка программиста и приводят
//! к панике с диагностикой.

use crate::runtime::{SharedMemory, SyncHead, SyncedMemory};
use ndarray::{ArrayD, IxDyn};
use parking_lot::{MappedMutexGuard, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Максимальное число осей тензора.
pub const MAX_AXES: usize = 32;

/// Guard только для чтения поверх буфера тензора.
pub struct ReadGuard<'a>(MappedMutexGuard<'a, [f32]>);

impl Deref for ReadGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

/// Guard для записи в буфер тензора.
pub type WriteGuard<'a> = MappedMutexGuard<'a, [f32]>;

pub struct Tensor {
    shape: Vec<usize>,
    count: usize,
    capacity: usize,
    value: SharedMemory,
    gradient: SharedMemory,
}

impl Tensor {
    /// Создает тензор заданной формы. Память выделяется при первом доступе.
    pub fn new(shape: &[usize]) -> Self {
        let mut tensor = Self::default();
        tensor.reshape(shape);
        tensor
    }

    /// Создает тензор и заполняет его значения из среза.
    ///
    /// # Panics
    /// Паникует, если длина среза не равна произведению размерностей.
    pub fn from_slice(shape: &[usize], data: &[f32]) -> Self {
        let tensor = Self::new(shape);
        assert_eq!(
            tensor.count,
            data.len(),
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        tensor.value_mut().copy_from_slice(data);
        tensor
    }

    /// Создает тензор из `ndarray`-массива.
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        let tensor = Self::new(array.shape());
        {
            let mut value = tensor.value_mut();
            for (dst, &src) in value.iter_mut().zip(array.iter()) {
                *dst = src;
            }
        }
        tensor
    }

    /// Меняет форму тензора.
    ///
    /// Если новое число элементов превышает `capacity`, выделяются новые
    /// (пока пустые) буферы; иначе меняется только описание формы.
    pub fn reshape(&mut self, shape: &[usize]) {
        assert!(
            shape.len() <= MAX_AXES,
            "tensor rank {} exceeds the maximum of {}",
            shape.len(),
            MAX_AXES
        );
        let count = shape.iter().product::<usize>();
        self.shape = shape.to_vec();
        self.count = count;
        if count > self.capacity {
            self.capacity = count;
            self.value = SyncedMemory::shared(count);
            self.gradient = SyncedMemory::shared(count);
        }
    }

    pub fn reshape_like(&mut self, other: &Tensor) {
        self.reshape(&other.shape);
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Размерность по оси; отрицательная ось отсчитывается с конца.
    pub fn shape_at(&self, axis: isize) -> usize {
        self.shape[self.canonical_axis_index(axis)]
    }

    pub fn num_axes(&self) -> usize {
        self.shape.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Произведение размерностей осей `[start, end)`.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        assert!(
            start <= end && end <= self.num_axes(),
            "axis range [{}, {}) is invalid for a tensor of rank {}",
            start,
            end,
            self.num_axes()
        );
        self.shape[start..end].iter().product()
    }

    /// Произведение размерностей начиная с оси `start`.
    pub fn count_from(&self, start: usize) -> usize {
        self.count_range(start, self.num_axes())
    }

    /// Приводит ось из диапазона `[-rank, rank)` к неотрицательному индексу.
    pub fn canonical_axis_index(&self, axis: isize) -> usize {
        let rank = self.num_axes() as isize;
        assert!(
            axis >= -rank && axis < rank,
            "axis {} out of range for {}-D tensor with shape {}",
            axis,
            rank,
            self.shape_string()
        );
        if axis < 0 {
            (axis + rank) as usize
        } else {
            axis as usize
        }
    }

    /// Размерность в 4-мерном (N, C, H, W) представлении; недостающие оси равны 1.
    fn legacy_dim(&self, index: usize) -> usize {
        self.shape.get(index).copied().unwrap_or(1)
    }

    pub fn num(&self) -> usize {
        self.legacy_dim(0)
    }

    pub fn channels(&self) -> usize {
        self.legacy_dim(1)
    }

    pub fn height(&self) -> usize {
        self.legacy_dim(2)
    }

    pub fn width(&self) -> usize {
        self.legacy_dim(3)
    }

    /// Линейное смещение `((n*C + c)*H + h)*W + w`.
    ///
    /// Индекс может быть равен размерности (граница диапазона), но не больше.
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        assert!(
            n <= self.num() && c <= self.channels() && h <= self.height() && w <= self.width(),
            "offset ({}, {}, {}, {}) out of range for shape {}",
            n,
            c,
            h,
            w,
            self.shape_string()
        );
        ((n * self.channels() + c) * self.height() + h) * self.width() + w
    }

    /// Строка вида `"2 3 4 (24)"` для логов.
    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("{} ({})", dims.join(" "), self.count)
    }

    // --- Доступ к буферам ---

    pub fn value(&self) -> ReadGuard<'_> {
        let count = self.count;
        ReadGuard(MutexGuard::map(self.value.lock(), move |m| {
            &mut m.host_view()[..count]
        }))
    }

    pub fn gradient(&self) -> ReadGuard<'_> {
        let count = self.count;
        ReadGuard(MutexGuard::map(self.gradient.lock(), move |m| {
            &mut m.host_view()[..count]
        }))
    }

    pub fn value_mut(&self) -> WriteGuard<'_> {
        let count = self.count;
        MutexGuard::map(self.value.lock(), move |m| {
            &mut m.mutable_host_data()[..count]
        })
    }

    pub fn gradient_mut(&self) -> WriteGuard<'_> {
        let count = self.count;
        MutexGuard::map(self.gradient.lock(), move |m| {
            &mut m.mutable_host_data()[..count]
        })
    }

    pub fn device_value(&self) -> ReadGuard<'_> {
        let count = self.count;
        ReadGuard(MutexGuard::map(self.value.lock(), move |m| {
            &mut m.device_view()[..count]
        }))
    }

    pub fn device_gradient(&self) -> ReadGuard<'_> {
        let count = self.count;
        ReadGuard(MutexGuard::map(self.gradient.lock(), move |m| {
            &mut m.device_view()[..count]
        }))
    }

    pub fn device_value_mut(&self) -> WriteGuard<'_> {
        let count = self.count;
        MutexGuard::map(self.value.lock(), move |m| {
            &mut m.mutable_device_data()[..count]
        })
    }

    pub fn device_gradient_mut(&self) -> WriteGuard<'_> {
        let count = self.count;
        MutexGuard::map(self.gradient.lock(), move |m| {
            &mut m.mutable_device_data()[..count]
        })
    }

    /// Буфер значений (для асинхронных копирований и проверки разделения).
    pub fn value_memory(&self) -> &SharedMemory {
        &self.value
    }

    pub fn gradient_memory(&self) -> &SharedMemory {
        &self.gradient
    }

    pub fn value_head(&self) -> SyncHead {
        self.value.lock().head()
    }

    /// Делят ли два тензора один буфер значений.
    pub fn shares_value_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    // --- Разделение буферов ---

    /// Перенимает буфер значений другого тензора; прежний буфер освобождается.
    ///
    /// # Panics
    /// Паникует, если число элементов тензоров различается.
    pub fn share_value(&mut self, other: &Tensor) {
        assert_eq!(
            self.count, other.count,
            "cannot share value of a tensor with {} elements into one with {}",
            other.count, self.count
        );
        self.value = Arc::clone(&other.value);
        self.refresh_capacity();
    }

    /// Перенимает буфер градиентов другого тензора.
    ///
    /// # Panics
    /// Паникует, если число элементов тензоров различается.
    pub fn share_gradient(&mut self, other: &Tensor) {
        assert_eq!(
            self.count, other.count,
            "cannot share gradient of a tensor with {} elements into one with {}",
            other.count, self.count
        );
        self.gradient = Arc::clone(&other.gradient);
        self.refresh_capacity();
    }

    /// Новый дескриптор, разделяющий оба буфера этого тензора.
    ///
    /// Так сеть отдает солверу обучаемые параметры слоев.
    pub fn alias(&self) -> Tensor {
        let mut alias = Tensor {
            shape: self.shape.clone(),
            count: self.count,
            capacity: 0,
            value: Arc::clone(&self.value),
            gradient: Arc::clone(&self.gradient),
        };
        alias.refresh_capacity();
        alias
    }

    // Разделенный буфер может быть короче собственного.
    fn refresh_capacity(&mut self) {
        let value_len = self.value.lock().len();
        let gradient_len = self.gradient.lock().len();
        self.capacity = value_len.min(gradient_len);
    }

    /// Копирует значения (или градиенты) другого тензора.
    ///
    /// При `reshape == false` формы обязаны совпадать по числу элементов.
    pub fn copy_from(&mut self, other: &Tensor, copy_gradient: bool, reshape: bool) {
        if self.count != other.count || self.shape != other.shape {
            assert!(
                reshape,
                "trying to copy tensors of different sizes: {} vs {}",
                self.shape_string(),
                other.shape_string()
            );
            self.reshape_like(other);
        }
        if copy_gradient {
            if Arc::ptr_eq(&self.gradient, &other.gradient) {
                return;
            }
            self.gradient_mut().copy_from_slice(&other.gradient());
        } else {
            if Arc::ptr_eq(&self.value, &other.value) {
                return;
            }
            self.value_mut().copy_from_slice(&other.value());
        }
    }

    pub fn set_value(&self, data: &[f32]) {
        self.value_mut().copy_from_slice(data);
    }

    pub fn fill_value(&self, v: f32) {
        self.value_mut().fill(v);
    }

    pub fn fill_gradient(&self, v: f32) {
        self.gradient_mut().fill(v);
    }

    // --- Арифметика ---

    /// `value -= gradient`. Считается на той стороне, где актуальны значения.
    pub fn update(&self) {
        match self.value_head() {
            SyncHead::HeadAtDevice | SyncHead::Synced => {
                let gradient = self.device_gradient();
                let mut value = self.device_value_mut();
                for (v, g) in value.iter_mut().zip(gradient.iter()) {
                    *v -= g;
                }
            }
            SyncHead::HeadAtHost | SyncHead::Uninitialized => {
                let gradient = self.gradient();
                let mut value = self.value_mut();
                for (v, g) in value.iter_mut().zip(gradient.iter()) {
                    *v -= g;
                }
            }
        }
    }

    pub fn scale_gradient(&self, factor: f32) {
        let device = matches!(
            self.gradient.lock().head(),
            SyncHead::HeadAtDevice | SyncHead::Synced
        );
        let mut gradient = if device {
            self.device_gradient_mut()
        } else {
            self.gradient_mut()
        };
        gradient.iter_mut().for_each(|g| *g *= factor);
    }

    pub fn sum_squared_gradient(&self) -> f32 {
        self.gradient().iter().map(|g| g * g).sum()
    }

    pub fn sum_abs_value(&self) -> f32 {
        self.value().iter().map(|v| v.abs()).sum()
    }

    pub fn sum_abs_gradient(&self) -> f32 {
        self.gradient().iter().map(|g| g.abs()).sum()
    }

    // --- Обмен с ndarray ---

    pub fn to_array(&self) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.value().to_vec())
            .expect("tensor count always equals the product of its shape")
    }

    pub fn gradient_to_array(&self) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.gradient().to_vec())
            .expect("tensor count always equals the product of its shape")
    }
}

impl Default for Tensor {
    /// Пустой тензор формы `[0]`.
    fn default() -> Self {
        Self {
            shape: vec![0],
            count: 0,
            capacity: 0,
            value: SyncedMemory::shared(0),
            gradient: SyncedMemory::shared(0),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_reshape_smaller_keeps_buffer() {
        let mut t = Tensor::new(&[2, 3, 4]);
        t.fill_value(1.0);
        let before = Arc::clone(t.value_memory());

        t.reshape(&[2, 3]);
        assert_eq!(t.count(), 6);
        assert_eq!(t.capacity(), 24);
        assert!(Arc::ptr_eq(&before, t.value_memory()));

        t.reshape(&[5, 5]);
        assert_eq!(t.capacity(), 25);
        assert!(!Arc::ptr_eq(&before, t.value_memory()));
    }

    #[test]
    fn test_canonical_axis_index() {
        let t = Tensor::new(&[2, 3, 4]);
        assert_eq!(t.canonical_axis_index(-1), 2);
        assert_eq!(t.canonical_axis_index(0), 0);
        assert_eq!(t.shape_at(-2), 3);
        assert_eq!(t.count_range(1, 3), 12);
        assert_eq!(t.count_from(1), 12);
    }

    #[test]
    #[should_panic(expected = "axis 3 out of range")]
    fn test_axis_out_of_range_panics() {
        Tensor::new(&[2, 3, 4]).canonical_axis_index(3);
    }

    #[test]
    fn test_offset() {
        let t = Tensor::new(&[2, 3, 4, 5]);
        assert_eq!(t.offset(1, 2, 3, 4), ((3 + 2) * 4 + 3) * 5 + 4);
        assert_eq!(t.offset(1, 0, 0, 0), 60);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_offset_out_of_range_panics() {
        Tensor::new(&[2, 3]).offset(0, 4, 0, 0);
    }

    #[test]
    fn test_share_value_aliases_buffer() {
        let a = Tensor::from_slice(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let mut b = Tensor::new(&[4]);
        b.share_value(&a);
        assert!(b.shares_value_with(&a));

        b.value_mut()[0] = 10.0;
        assert_eq!(a.value()[0], 10.0);
        // Градиенты остаются независимыми.
        b.fill_gradient(1.0);
        assert_eq!(a.sum_abs_gradient(), 0.0);
    }

    #[test]
    #[should_panic(expected = "cannot share value")]
    fn test_share_value_count_mismatch_panics() {
        let a = Tensor::new(&[3]);
        let mut b = Tensor::new(&[4]);
        b.share_value(&a);
    }

    #[test]
    fn test_update_and_gradient_reductions() {
        let t = Tensor::from_slice(&[3], &[1.0, 2.0, 3.0]);
        t.gradient_mut().copy_from_slice(&[0.5, -1.0, 2.0]);
        assert_relative_eq!(t.sum_squared_gradient(), 5.25);

        t.scale_gradient(2.0);
        t.update();
        assert_eq!(&*t.value(), &[0.0, 4.0, -1.0]);
        assert_relative_eq!(t.sum_abs_value(), 5.0);
    }

    #[test]
    fn test_update_on_device_side() {
        let t = Tensor::new(&[2]);
        t.device_value_mut().copy_from_slice(&[1.0, 1.0]);
        t.device_gradient_mut().copy_from_slice(&[0.25, 0.5]);
        t.update();
        assert_eq!(t.value_head(), SyncHead::HeadAtDevice);
        assert_eq!(&*t.value(), &[0.75, 0.5]);
    }

    #[test]
    fn test_copy_from_with_reshape() {
        let src = Tensor::from_slice(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let mut dst = Tensor::new(&[3]);
        dst.copy_from(&src, false, true);
        assert_eq!(dst.shape(), &[2, 2]);
        assert_eq!(&*dst.value(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_array_conversions() {
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|x| x as f32).collect())
            .unwrap();
        let t = Tensor::from_array(&arr);
        assert_eq!(t.shape_string(), "2 3 (6)");
        assert_eq!(t.to_array(), arr);
    }

    proptest! {
        #[test]
        fn prop_reshape_tracks_max_capacity(shapes in prop::collection::vec(
            prop::collection::vec(1usize..6, 1..4), 1..8)
        ) {
            let mut t = Tensor::default();
            let mut max_count = 0;
            for shape in &shapes {
                let before = Arc::clone(t.value_memory());
                let count: usize = shape.iter().product();
                t.reshape(shape);
                prop_assert_eq!(t.count(), count);
                if count <= max_count {
                    prop_assert!(Arc::ptr_eq(&before, t.value_memory()));
                } else {
                    max_count = count;
                }
                prop_assert_eq!(t.capacity(), max_count);
            }
        }
    }
}
