/*
 * MIT License
 *
 * Copyright (c) 2025 Matthew Abbott
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

pub const CUDA_KERNELS: &str = r#"
extern "C" {

#define ACT_RELU 0
#define ACT_SCALED 1

__device__ float d_Activate(float x, int kind, float scale) {
    if (kind == ACT_RELU) return (x > 0.0f || isnan(x)) ? x : 0.0f;
    return scale * x;
}

__device__ float d_ActivateDerivative(float y, int kind, float scale) {
    if (kind == ACT_RELU) return (y > 0.0f) ? 1.0f : 0.0f;
    return scale;
}

__global__ void extract_luma_kernel(float* luma, const float* pixels,
                                     int width, int height, int bpp) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= width * height) return;
    const float* px = pixels + i * bpp;
    float y = (bpp >= 3) ? (0.299f * px[0] + 0.587f * px[1] + 0.114f * px[2]) : px[0];
    luma[i] = y / 255.0f;
}

// One thread per output value, planar [filter][y][x]
__global__ void layer_forward_kernel(float* output, const float* input,
                                      const float* weights, const float* bias,
                                      int f, int in_channels, int out_channels,
                                      int in_w, int in_h, int act_kind, float act_scale) {
    int out_w = in_w - f + 1;
    int out_h = in_h - f + 1;
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= out_channels * out_h * out_w) return;

    int k = idx / (out_h * out_w);
    int rem = idx % (out_h * out_w);
    int y = rem / out_w;
    int x = rem % out_w;

    float sum = bias[k];
    for (int c = 0; c < in_channels; c++) {
        for (int dy = 0; dy < f; dy++) {
            for (int dx = 0; dx < f; dx++) {
                int in_idx = c * in_h * in_w + (y + dy) * in_w + (x + dx);
                int w_idx = ((k * in_channels + c) * f + dy) * f + dx;
                sum += input[in_idx] * weights[w_idx];
            }
        }
    }
    output[idx] = d_Activate(sum, act_kind, act_scale);
}

// Single block reductions: mode 0 = sum (a-b)^2, 1 = sum a^2, 2 = sum a
__global__ void reduce_kernel(float* out, int slot, const float* a, const float* b,
                               int count, int mode) {
    __shared__ double partial[256];
    double acc = 0.0;
    for (int i = threadIdx.x; i < count; i += blockDim.x) {
        double v = (double)a[i];
        if (mode == 0) {
            double d = v - (double)b[i];
            acc += d * d;
        } else if (mode == 1) {
            acc += v * v;
        } else {
            acc += v;
        }
    }
    partial[threadIdx.x] = acc;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (threadIdx.x < s) partial[threadIdx.x] += partial[threadIdx.x + s];
        __syncthreads();
    }
    if (threadIdx.x == 0) out[slot] = (float)partial[0];
}

__global__ void add_scalar_kernel(float* buffer, int count, float value) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < count) buffer[i] += value;
}

__global__ void crop_kernel(float* dst, const float* src, int src_w,
                             int left, int top, int width, int height) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= width * height) return;
    int y = i / width;
    int x = i % width;
    dst[i] = src[(top + y) * src_w + left + x];
}

__global__ void output_deltas_kernel(float* deltas, const float* predicted,
                                      const float* expected, int count, float scale) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < count) deltas[i] = (predicted[i] - expected[i]) * scale;
}

// One thread per value of the current layer; next layer geometry given.
__global__ void backprop_deltas_kernel(float* deltas, const float* next_deltas,
                                        const float* next_weights, const float* output,
                                        int f, int in_channels, int out_channels,
                                        int in_w, int in_h, int act_kind, float act_scale) {
    int out_w = in_w - f + 1;
    int out_h = in_h - f + 1;
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= in_channels * in_h * in_w) return;

    int c = idx / (in_h * in_w);
    int rem = idx % (in_h * in_w);
    int y = rem / in_w;
    int x = rem % in_w;

    float sum = 0.0f;
    for (int k = 0; k < out_channels; k++) {
        for (int dy = 0; dy < f; dy++) {
            int oy = y - dy;
            if (oy < 0 || oy >= out_h) continue;
            for (int dx = 0; dx < f; dx++) {
                int ox = x - dx;
                if (ox < 0 || ox >= out_w) continue;
                int w_idx = ((k * in_channels + c) * f + dy) * f + dx;
                sum += next_deltas[(k * out_h + oy) * out_w + ox] * next_weights[w_idx];
            }
        }
    }
    deltas[idx] = sum * d_ActivateDerivative(output[idx], act_kind, act_scale);
}

// One thread per weight; accumulates into the existing gradient
__global__ void weight_grad_kernel(float* grad_weights, const float* deltas,
                                    const float* input, const float* weights,
                                    int f, int in_channels, int out_channels,
                                    int in_w, int in_h, float decay) {
    int out_w = in_w - f + 1;
    int out_h = in_h - f + 1;
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= out_channels * in_channels * f * f) return;

    int k = idx / (in_channels * f * f);
    int rem = idx % (in_channels * f * f);
    int c = rem / (f * f);
    rem = rem % (f * f);
    int dy = rem / f;
    int dx = rem % f;

    float g = 0.0f;
    for (int y = 0; y < out_h; y++) {
        for (int x = 0; x < out_w; x++) {
            g += deltas[(k * out_h + y) * out_w + x] *
                 input[c * in_h * in_w + (y + dy) * in_w + (x + dx)];
        }
    }
    grad_weights[idx] += g + decay * weights[idx];
}

__global__ void bias_grad_kernel(float* grad_bias, const float* deltas,
                                  int out_channels, int plane) {
    int k = blockIdx.x * blockDim.x + threadIdx.x;
    if (k >= out_channels) return;
    float sum = 0.0f;
    for (int i = 0; i < plane; i++) sum += deltas[k * plane + i];
    grad_bias[k] += sum;
}

__global__ void apply_gradients_kernel(float* params, float* grads, int count,
                                        float rate, float batch_size) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= count) return;
    params[i] -= rate * (grads[i] / batch_size);
    grads[i] = 0.0f;
}

}
"#;

pub const KERNEL_NAMES: &[&str] = &[
    "extract_luma_kernel",
    "layer_forward_kernel",
    "reduce_kernel",
    "add_scalar_kernel",
    "crop_kernel",
    "output_deltas_kernel",
    "backprop_deltas_kernel",
    "weight_grad_kernel",
    "bias_grad_kernel",
    "apply_gradients_kernel",
];

pub const MODULE_NAME: &str = "srcnn_kernels";
