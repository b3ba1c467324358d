//! Row-major single-precision GEMM used by the convolution primitive.
//!
//! `C = alpha * op(A) * op(B) + beta * C` with `op(A): m×k`, `op(B): k×n`.
//! Backed by `matrixmultiply`, or by CBLAS with the `blas` feature.

#[cfg(feature = "blas")]
mod imp {
    use cblas_sys::*;

    pub type Trans = CBLAS_TRANSPOSE;

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn sgemm_rowmajor(
        trans_a: Trans,
        trans_b: Trans,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) {
        // Row-major leading dims via pattern match (no PartialEq needed)
        let lda = match trans_a {
            CBLAS_TRANSPOSE::CblasNoTrans => k,
            _ => m,
        };
        let ldb = match trans_b {
            CBLAS_TRANSPOSE::CblasNoTrans => n,
            _ => k,
        };

        unsafe {
            cblas_sgemm(
                CBLAS_LAYOUT::CblasRowMajor,
                trans_a,
                trans_b,
                m as i32,
                n as i32,
                k as i32,
                alpha,
                a.as_ptr(),
                lda as i32,
                b.as_ptr(),
                ldb as i32,
                beta,
                c.as_mut_ptr(),
                n as i32,
            );
        }
    }

    #[inline]
    pub fn n() -> Trans {
        CBLAS_TRANSPOSE::CblasNoTrans
    }
    #[inline]
    pub fn t() -> Trans {
        CBLAS_TRANSPOSE::CblasTrans
    }
}

#[cfg(not(feature = "blas"))]
mod imp {
    use matrixmultiply::sgemm;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum Trans {
        N,
        T,
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn sgemm_rowmajor(
        trans_a: Trans,
        trans_b: Trans,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) {
        assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);

        // Row-major view strides for op(A)
        let (a_rs, a_cs): (isize, isize) = match trans_a {
            Trans::N => (k as isize, 1), // rows spaced by k, cols by 1
            Trans::T => (1, m as isize), // rows spaced by 1, cols by m
        };
        // Row-major view strides for op(B)
        let (b_rs, b_cs): (isize, isize) = match trans_b {
            Trans::N => (n as isize, 1),
            Trans::T => (1, k as isize),
        };

        let (c_rs, c_cs) = (n as isize, 1);

        // SAFETY: the assert above keeps every strided access inside the slices.
        unsafe {
            sgemm(
                m,
                k,
                n,
                alpha,
                a.as_ptr(),
                a_rs,
                a_cs,
                b.as_ptr(),
                b_rs,
                b_cs,
                beta,
                c.as_mut_ptr(),
                c_rs,
                c_cs,
            );
        }
    }

    #[inline]
    pub fn n() -> Trans {
        Trans::N
    }
    #[inline]
    pub fn t() -> Trans {
        Trans::T
    }
}

pub use imp::{n, sgemm_rowmajor, t, Trans};
